use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use super::{
    typed_handler, AnyMessage, Decoded, MessageRouter, MsgId, NamedMessage, Processor, RawMessage,
    Route, UserData,
};
use crate::network::ByteOrder;
use crate::{AppError, AppResult};

/// Width of the message index in front of every body.
const INDEX_LEN: usize = 2;
const MAX_MESSAGES: usize = u16::MAX as usize;

type DecodeFn = fn(&[u8]) -> AppResult<Arc<dyn AnyMessage>>;
type EncodeFn = fn(&dyn AnyMessage) -> AppResult<Vec<u8>>;

struct ProtoEntry {
    name: &'static str,
    decode: DecodeFn,
    encode: EncodeFn,
    route: Route,
}

fn decode_body<T>(body: &[u8]) -> AppResult<Arc<dyn AnyMessage>>
where
    T: NamedMessage + prost::Message + Default,
{
    Ok(Arc::new(T::decode(body)?))
}

fn encode_body<T>(msg: &dyn AnyMessage) -> AppResult<Vec<u8>>
where
    T: NamedMessage + prost::Message,
{
    msg.downcast_ref::<T>()
        .map(prost::Message::encode_to_vec)
        .ok_or_else(|| AppError::IllegalStateError(format!("{} registered with another type", T::NAME)))
}

/// Protobuf messages behind a 2-byte index, assigned from 1 in registration order.
pub struct ProtobufProcessor {
    byte_order: ByteOrder,
    entries: Vec<ProtoEntry>,
    indices: HashMap<&'static str, u16>,
}

impl Default for ProtobufProcessor {
    fn default() -> Self {
        ProtobufProcessor {
            byte_order: ByteOrder::BigEndian,
            entries: Vec::new(),
            indices: HashMap::new(),
        }
    }
}

impl ProtobufProcessor {
    pub fn new() -> ProtobufProcessor {
        ProtobufProcessor::default()
    }

    pub fn set_byte_order(&mut self, little_endian: bool) {
        self.byte_order = ByteOrder::from_little_endian(little_endian);
    }

    /// Registers `T` and returns its wire index.
    pub fn register<T>(&mut self) -> AppResult<u16>
    where
        T: NamedMessage + prost::Message + Default,
    {
        if self.indices.contains_key(T::NAME) {
            return Err(AppError::DuplicateRegistration(T::NAME.to_string()));
        }
        if self.entries.len() >= MAX_MESSAGES {
            return Err(AppError::TooManyMessages(MAX_MESSAGES));
        }

        self.entries.push(ProtoEntry {
            name: T::NAME,
            decode: decode_body::<T>,
            encode: encode_body::<T>,
            route: Route::default(),
        });
        let index = self.entries.len() as u16;
        self.indices.insert(T::NAME, index);
        Ok(index)
    }

    pub fn index_of<T: NamedMessage>(&self) -> Option<u16> {
        self.indices.get(T::NAME).copied()
    }

    fn entry(&self, index: u16) -> AppResult<&ProtoEntry> {
        (index as usize)
            .checked_sub(1)
            .and_then(|slot| self.entries.get(slot))
            .ok_or_else(|| AppError::UnregisteredMessage(MsgId::Index(index).to_string()))
    }

    fn entry_mut(&mut self, index: u16) -> AppResult<&mut ProtoEntry> {
        (index as usize)
            .checked_sub(1)
            .and_then(|slot| self.entries.get_mut(slot))
            .ok_or_else(|| AppError::UnregisteredMessage(MsgId::Index(index).to_string()))
    }

    fn named_entry_mut(&mut self, name: &'static str) -> AppResult<(u16, &mut ProtoEntry)> {
        let index = *self
            .indices
            .get(name)
            .ok_or_else(|| AppError::UnregisteredMessage(name.to_string()))?;
        Ok((index, self.entry_mut(index)?))
    }

    pub fn set_handler<T, F>(&mut self, handler: F) -> AppResult<()>
    where
        T: NamedMessage,
        F: Fn(&T, &UserData) + Send + Sync + 'static,
    {
        let (index, entry) = self.named_entry_mut(T::NAME)?;
        entry.route.set_handler(MsgId::Index(index), typed_handler(handler))
    }

    pub fn set_router<T: NamedMessage>(&mut self, router: Arc<dyn MessageRouter>) -> AppResult<()> {
        let (index, entry) = self.named_entry_mut(T::NAME)?;
        entry.route.set_router(MsgId::Index(index), router)
    }

    pub fn set_raw_handler<F>(&mut self, index: u16, handler: F) -> AppResult<()>
    where
        F: Fn(RawMessage, &UserData) + Send + Sync + 'static,
    {
        self.entry_mut(index)?
            .route
            .set_raw_handler(MsgId::Index(index), Arc::new(handler))
    }

    /// Registered messages in index order.
    pub fn range(&self) -> impl Iterator<Item = (MsgId, &'static str)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(slot, entry)| (MsgId::Index(slot as u16 + 1), entry.name))
    }

    fn index_bytes(&self, index: u16) -> Bytes {
        let mut buffer = BytesMut::with_capacity(INDEX_LEN);
        match self.byte_order {
            ByteOrder::BigEndian => buffer.put_u16(index),
            ByteOrder::LittleEndian => buffer.put_u16_le(index),
        }
        buffer.freeze()
    }
}

impl Processor for ProtobufProcessor {
    fn decode(&self, data: Bytes) -> AppResult<Decoded> {
        if data.len() < INDEX_LEN {
            return Err(AppError::MalformedMessage(format!(
                "protobuf message of {} bytes has no index",
                data.len()
            )));
        }
        let mut prefix = &data[..INDEX_LEN];
        let index = match self.byte_order {
            ByteOrder::BigEndian => prefix.get_u16(),
            ByteOrder::LittleEndian => prefix.get_u16_le(),
        };

        let entry = self.entry(index)?;
        if entry.route.is_raw() {
            return Ok(Decoded::Raw(RawMessage {
                id: MsgId::Index(index),
                body: data.slice(INDEX_LEN..),
            }));
        }
        Ok(Decoded::Typed((entry.decode)(&data[INDEX_LEN..])?))
    }

    fn encode(&self, msg: &dyn AnyMessage) -> AppResult<Vec<Bytes>> {
        let index = *self
            .indices
            .get(msg.message_name())
            .ok_or_else(|| AppError::UnregisteredMessage(msg.message_name().to_string()))?;
        let body = (self.entry(index)?.encode)(msg)?;
        Ok(vec![self.index_bytes(index), Bytes::from(body)])
    }

    fn dispatch(&self, msg: Decoded, user_data: &UserData) -> AppResult<()> {
        match msg {
            Decoded::Raw(raw) => {
                let MsgId::Index(index) = raw.id else {
                    return Err(AppError::UnregisteredMessage(raw.id.to_string()));
                };
                self.entry(index)?.route.dispatch_raw(raw, user_data);
            }
            Decoded::Typed(msg) => {
                let index = *self
                    .indices
                    .get(msg.message_name())
                    .ok_or_else(|| AppError::UnregisteredMessage(msg.message_name().to_string()))?;
                let entry = self.entry(index)?;
                trace!("dispatching protobuf message {} as #{}", entry.name, index);
                entry.route.dispatch(entry.name, msg, user_data);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, PartialEq, prost::Message)]
    struct LoginRequest {
        #[prost(string, tag = "1")]
        account: String,
        #[prost(uint32, tag = "2")]
        version: u32,
    }

    impl NamedMessage for LoginRequest {
        const NAME: &'static str = "LoginRequest";
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct LoginResponse {
        #[prost(bool, tag = "1")]
        ok: bool,
    }

    impl NamedMessage for LoginResponse {
        const NAME: &'static str = "LoginResponse";
    }

    fn processor() -> ProtobufProcessor {
        let mut processor = ProtobufProcessor::new();
        assert_eq!(processor.register::<LoginRequest>().unwrap(), 1);
        assert_eq!(processor.register::<LoginResponse>().unwrap(), 2);
        processor
    }

    fn login() -> LoginRequest {
        LoginRequest {
            account: "alice".into(),
            version: 3,
        }
    }

    #[test]
    fn test_first_registration_gets_index_one() {
        let processor = processor();
        let parts = processor.encode(&login()).unwrap();
        assert_eq!(parts[0], Bytes::from_static(&[0x00, 0x01]));
        assert_eq!(parts[1], Bytes::from(prost::Message::encode_to_vec(&login())));

        let wire: Vec<u8> = parts.concat();
        let Decoded::Typed(msg) = processor.decode(Bytes::from(wire)).unwrap() else {
            panic!("expected a typed message");
        };
        assert_eq!(msg.downcast_ref::<LoginRequest>(), Some(&login()));
    }

    #[test]
    fn test_little_endian_index() {
        let mut processor = processor();
        processor.set_byte_order(true);
        let parts = processor.encode(&LoginResponse { ok: true }).unwrap();
        assert_eq!(parts[0], Bytes::from_static(&[0x02, 0x00]));
        assert_eq!(processor.index_of::<LoginResponse>(), Some(2));
    }

    #[test]
    fn test_dispatch_to_handler_and_router() {
        let mut processor = processor();
        let (tx, rx) = async_channel::bounded(8);
        let accounts = Arc::new(Mutex::new(Vec::new()));
        let seen = accounts.clone();
        processor
            .set_handler::<LoginRequest, _>(move |msg: &LoginRequest, _: &UserData| {
                seen.lock().push(msg.account.clone())
            })
            .unwrap();
        processor.set_router::<LoginRequest>(Arc::new(tx)).unwrap();

        let wire = processor.encode(&login()).unwrap().concat();
        let decoded = processor.decode(Bytes::from(wire)).unwrap();
        let user_data: UserData = Some(Arc::new(7u32));
        processor.dispatch(decoded, &user_data).unwrap();

        assert_eq!(*accounts.lock(), vec!["alice".to_string()]);
        let routed = rx.try_recv().unwrap();
        assert_eq!(routed.name, "LoginRequest");
        assert!(routed.msg.is::<LoginRequest>());
    }

    #[test]
    fn test_raw_handler_gets_body_only() {
        let mut processor = processor();
        let raw = Arc::new(Mutex::new(None));
        let captured = raw.clone();
        processor
            .set_raw_handler(2, move |msg, _| *captured.lock() = Some(msg))
            .unwrap();

        let decoded = processor
            .decode(Bytes::from_static(&[0x00, 0x02, 0x08, 0x01]))
            .unwrap();
        assert!(matches!(decoded, Decoded::Raw(_)));
        processor.dispatch(decoded, &None).unwrap();

        let raw = raw.lock().take().unwrap();
        assert_eq!(raw.id, MsgId::Index(2));
        assert_eq!(raw.body, Bytes::from_static(&[0x08, 0x01]));
    }

    #[test]
    fn test_decode_errors() {
        let processor = processor();
        assert!(matches!(
            processor.decode(Bytes::from_static(&[0x00])),
            Err(AppError::MalformedMessage(_))
        ));
        assert!(matches!(
            processor.decode(Bytes::from_static(&[0x00, 0x00])),
            Err(AppError::UnregisteredMessage(_))
        ));
        assert!(matches!(
            processor.decode(Bytes::from_static(&[0x00, 0x03])),
            Err(AppError::UnregisteredMessage(_))
        ));
        assert!(matches!(
            processor.decode(Bytes::from_static(&[0x00, 0x01, 0xff])),
            Err(AppError::ProtobufDecode(_))
        ));
    }

    #[test]
    fn test_registration_errors() {
        let mut processor = processor();
        assert!(matches!(
            processor.register::<LoginRequest>(),
            Err(AppError::DuplicateRegistration(_))
        ));
        assert!(matches!(
            processor.set_raw_handler(0, |_, _| {}),
            Err(AppError::UnregisteredMessage(_))
        ));
        assert!(matches!(
            processor.set_raw_handler(9, |_, _| {}),
            Err(AppError::UnregisteredMessage(_))
        ));
        let names: Vec<_> = processor.range().collect();
        assert_eq!(
            names,
            vec![
                (MsgId::Index(1), "LoginRequest"),
                (MsgId::Index(2), "LoginResponse")
            ]
        );
    }
}
