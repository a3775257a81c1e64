use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::trace;

use super::{
    typed_handler, AnyMessage, Decoded, MessageRouter, MsgId, NamedMessage, Processor, RawMessage,
    Route, UserData,
};
use crate::{AppError, AppResult};

type DecodeFn = fn(&RawValue) -> AppResult<Arc<dyn AnyMessage>>;
type EncodeFn = fn(&dyn AnyMessage) -> AppResult<Vec<u8>>;

struct JsonEntry {
    name: &'static str,
    decode: DecodeFn,
    encode: EncodeFn,
    route: Route,
}

fn decode_body<T>(body: &RawValue) -> AppResult<Arc<dyn AnyMessage>>
where
    T: NamedMessage + DeserializeOwned,
{
    let msg: T = serde_json::from_str(body.get())?;
    Ok(Arc::new(msg))
}

fn encode_message<T>(msg: &dyn AnyMessage) -> AppResult<Vec<u8>>
where
    T: NamedMessage + Serialize,
{
    let msg = msg
        .downcast_ref::<T>()
        .ok_or_else(|| AppError::IllegalStateError(format!("{} registered with another type", T::NAME)))?;
    let mut object = BTreeMap::new();
    object.insert(T::NAME, msg);
    Ok(serde_json::to_vec(&object)?)
}

/// JSON messages of the form `{"Name": body}`.
#[derive(Default)]
pub struct JsonProcessor {
    entries: HashMap<&'static str, JsonEntry>,
    order: Vec<&'static str>,
}

impl JsonProcessor {
    pub fn new() -> JsonProcessor {
        JsonProcessor::default()
    }

    pub fn register<T>(&mut self) -> AppResult<()>
    where
        T: NamedMessage + Serialize + DeserializeOwned,
    {
        if self.entries.contains_key(T::NAME) {
            return Err(AppError::DuplicateRegistration(T::NAME.to_string()));
        }
        self.entries.insert(
            T::NAME,
            JsonEntry {
                name: T::NAME,
                decode: decode_body::<T>,
                encode: encode_message::<T>,
                route: Route::default(),
            },
        );
        self.order.push(T::NAME);
        Ok(())
    }

    fn entry_mut(&mut self, name: &str) -> AppResult<&mut JsonEntry> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| AppError::UnregisteredMessage(name.to_string()))
    }

    /// Sets the inline handler, run on the read loop of the receiving connection.
    pub fn set_handler<T, F>(&mut self, handler: F) -> AppResult<()>
    where
        T: NamedMessage,
        F: Fn(&T, &UserData) + Send + Sync + 'static,
    {
        self.entry_mut(T::NAME)?
            .route
            .set_handler(MsgId::Name(T::NAME), typed_handler(handler))
    }

    pub fn set_router<T: NamedMessage>(&mut self, router: Arc<dyn MessageRouter>) -> AppResult<()> {
        self.entry_mut(T::NAME)?
            .route
            .set_router(MsgId::Name(T::NAME), router)
    }

    /// Messages with a raw handler are only identified, their body stays undecoded.
    pub fn set_raw_handler<F>(&mut self, name: &str, handler: F) -> AppResult<()>
    where
        F: Fn(RawMessage, &UserData) + Send + Sync + 'static,
    {
        let entry = self.entry_mut(name)?;
        let id = MsgId::Name(entry.name);
        entry.route.set_raw_handler(id, Arc::new(handler))
    }

    /// Registered messages in registration order.
    pub fn range(&self) -> impl Iterator<Item = (MsgId, &'static str)> + '_ {
        self.order.iter().map(|&name| (MsgId::Name(name), name))
    }

    fn entry(&self, id: MsgId) -> AppResult<&JsonEntry> {
        let name = match id {
            MsgId::Name(name) => name,
            MsgId::Index(_) => return Err(AppError::UnregisteredMessage(id.to_string())),
        };
        self.entries
            .get(name)
            .ok_or_else(|| AppError::UnregisteredMessage(name.to_string()))
    }
}

impl Processor for JsonProcessor {
    fn decode(&self, data: Bytes) -> AppResult<Decoded> {
        let object: HashMap<String, Box<RawValue>> = serde_json::from_slice(&data)?;
        if object.len() != 1 {
            return Err(AppError::MalformedMessage(format!(
                "expected one message entry, found {}",
                object.len()
            )));
        }
        let Some((name, body)) = object.into_iter().next() else {
            return Err(AppError::MalformedMessage("empty message object".into()));
        };

        let entry = self
            .entries
            .get(name.as_str())
            .ok_or(AppError::UnregisteredMessage(name))?;
        if entry.route.is_raw() {
            return Ok(Decoded::Raw(RawMessage {
                id: MsgId::Name(entry.name),
                body: Bytes::copy_from_slice(body.get().as_bytes()),
            }));
        }
        Ok(Decoded::Typed((entry.decode)(&body)?))
    }

    fn encode(&self, msg: &dyn AnyMessage) -> AppResult<Vec<Bytes>> {
        let entry = self.entry(MsgId::Name(msg.message_name()))?;
        Ok(vec![Bytes::from((entry.encode)(msg)?)])
    }

    fn dispatch(&self, msg: Decoded, user_data: &UserData) -> AppResult<()> {
        match msg {
            Decoded::Raw(raw) => {
                let entry = self.entry(raw.id)?;
                entry.route.dispatch_raw(raw, user_data);
            }
            Decoded::Typed(msg) => {
                let entry = self.entry(MsgId::Name(msg.message_name()))?;
                trace!("dispatching json message {}", entry.name);
                entry.route.dispatch(entry.name, msg, user_data);
            }
        }
        Ok(())
    }
}
