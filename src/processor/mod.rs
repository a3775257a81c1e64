//! Message processors.
//!
//! A processor maps a message identity to its registered shape and handlers.
//! [`JsonProcessor`] identifies a message by its name, the only key of a JSON
//! object; [`ProtobufProcessor`] by a 2-byte index in front of the protobuf
//! body. Registration happens once at setup, the table is read-only afterwards.
//!
//! A decoded message is dispatched to its inline handler, which runs on the
//! connection's read loop and must not block, and to its [`MessageRouter`],
//! which forwards it to a service mailbox. A raw handler replaces both and
//! receives the undecoded body.

use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::{AppError, AppResult};

pub use json::JsonProcessor;
pub use protobuf::ProtobufProcessor;

mod json;
mod protobuf;

/// A message shape known to a processor under a fixed name.
pub trait NamedMessage: Any + Send + Sync + Debug {
    const NAME: &'static str;
}

/// Object-safe view of a [`NamedMessage`].
pub trait AnyMessage: Any + Send + Sync + Debug {
    fn message_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: NamedMessage> AnyMessage for T {
    fn message_name(&self) -> &'static str {
        T::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl dyn AnyMessage {
    pub fn is<T: NamedMessage>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: NamedMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast<T: NamedMessage>(self: Arc<Self>) -> Option<Arc<T>> {
        self.into_any_arc().downcast::<T>().ok()
    }
}

/// Per-connection value owned by the application, handed to every dispatch.
pub type UserData = Option<Arc<dyn Any + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgId {
    Name(&'static str),
    Index(u16),
}

impl Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgId::Name(name) => write!(f, "{}", name),
            MsgId::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// An identified but undecoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MsgId,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub enum Decoded {
    Typed(Arc<dyn AnyMessage>),
    Raw(RawMessage),
}

/// A message submitted to a [`MessageRouter`].
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub name: &'static str,
    pub msg: Arc<dyn AnyMessage>,
    pub user_data: UserData,
}

/// Fire-and-forget sink for decoded messages, usually a service mailbox.
pub trait MessageRouter: Send + Sync + 'static {
    /// Must not block the calling read loop.
    fn submit(&self, msg: RoutedMessage);
}

impl MessageRouter for async_channel::Sender<RoutedMessage> {
    fn submit(&self, msg: RoutedMessage) {
        match self.try_send(msg) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(msg)) => {
                warn!("mailbox full, dropped message {}", msg.name)
            }
            Err(async_channel::TrySendError::Closed(msg)) => {
                warn!("mailbox closed, dropped message {}", msg.name)
            }
        }
    }
}

/// Decodes, encodes and dispatches the messages of one wire format.
pub trait Processor: Send + Sync + 'static {
    fn decode(&self, data: Bytes) -> AppResult<Decoded>;

    /// Returns the segments of one wire message, to be written together.
    fn encode(&self, msg: &dyn AnyMessage) -> AppResult<Vec<Bytes>>;

    fn dispatch(&self, msg: Decoded, user_data: &UserData) -> AppResult<()>;
}

pub(crate) type Handler = Arc<dyn Fn(&dyn AnyMessage, &UserData) + Send + Sync>;
pub(crate) type RawHandler = Arc<dyn Fn(RawMessage, &UserData) + Send + Sync>;

pub(crate) fn typed_handler<T, F>(handler: F) -> Handler
where
    T: NamedMessage,
    F: Fn(&T, &UserData) + Send + Sync + 'static,
{
    Arc::new(move |msg: &dyn AnyMessage, user_data: &UserData| {
        if let Some(msg) = msg.downcast_ref::<T>() {
            handler(msg, user_data);
        }
    })
}

/// Where a registered message goes once decoded.
#[derive(Default)]
pub(crate) struct Route {
    handler: Option<Handler>,
    router: Option<Arc<dyn MessageRouter>>,
    raw_handler: Option<RawHandler>,
}

impl Route {
    pub(crate) fn is_raw(&self) -> bool {
        self.raw_handler.is_some()
    }

    pub(crate) fn set_handler(&mut self, id: MsgId, handler: Handler) -> AppResult<()> {
        if self.handler.is_some() {
            return Err(AppError::DuplicateRegistration(format!("handler of {}", id)));
        }
        self.handler = Some(handler);
        Ok(())
    }

    pub(crate) fn set_router(&mut self, id: MsgId, router: Arc<dyn MessageRouter>) -> AppResult<()> {
        if self.router.is_some() {
            return Err(AppError::DuplicateRegistration(format!("router of {}", id)));
        }
        self.router = Some(router);
        Ok(())
    }

    pub(crate) fn set_raw_handler(&mut self, id: MsgId, handler: RawHandler) -> AppResult<()> {
        if self.raw_handler.is_some() {
            return Err(AppError::DuplicateRegistration(format!("raw handler of {}", id)));
        }
        self.raw_handler = Some(handler);
        Ok(())
    }

    pub(crate) fn dispatch(&self, name: &'static str, msg: Arc<dyn AnyMessage>, user_data: &UserData) {
        if self.handler.is_none() && self.router.is_none() {
            trace!("no handler for message {}, dropped", name);
            return;
        }
        if let Some(handler) = &self.handler {
            handler(&*msg, user_data);
        }
        if let Some(router) = &self.router {
            router.submit(RoutedMessage {
                name,
                msg,
                user_data: user_data.clone(),
            });
        }
    }

    pub(crate) fn dispatch_raw(&self, msg: RawMessage, user_data: &UserData) {
        match &self.raw_handler {
            Some(handler) => handler(msg, user_data),
            None => trace!("no raw handler for message {}, dropped", msg.id),
        }
    }
}
