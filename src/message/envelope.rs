use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{Protocol, ThriftStruct};
use crate::error::CodecError;
use crate::message::control::ControlMessage;
use crate::message::header::BaseHeader;
use crate::net::socket_id::SocketId;

/// dispatch name of envelopes whose body is relayed without being decoded
pub const BINARY_FORWARD_MSG: &str = "binary_forward_msg";

/// An application-defined message body. Every [`ThriftStruct`] that is `Debug + Send + Sync`
///  is one.
pub trait AppMessage: Debug + Send + Sync + 'static {
    fn write_body(&self, proto: &mut dyn Protocol) -> Result<(), CodecError>;
    fn as_any(&self) -> &dyn Any;
}

impl <T: ThriftStruct + Debug + Send + Sync + 'static> AppMessage for T {
    fn write_body(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        self.write(proto)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    Control(ControlMessage),
    App(Arc<dyn AppMessage>),
    /// the still-encoded remainder of a frame that is not addressed to this node
    Forward(Bytes),
}

impl MessageBody {
    pub fn app<T: AppMessage>(&self) -> Option<&T> {
        match self {
            MessageBody::App(msg) => msg.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn control(&self) -> Option<&ControlMessage> {
        match self {
            MessageBody::Control(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn forward(&self) -> Option<&Bytes> {
        match self {
            MessageBody::Forward(raw) => Some(raw),
            _ => None,
        }
    }
}

/// One message: local routing metadata, the wire sub-header and the body.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// the name the message is dispatched under; [`BINARY_FORWARD_MSG`] for forward bodies
    pub name: String,
    /// the channel the message was received on
    pub src_sid: Option<SocketId>,
    pub header: BaseHeader,
    pub body: MessageBody,
}

impl MessageEnvelope {
    pub fn new(header: BaseHeader, body: MessageBody) -> MessageEnvelope {
        MessageEnvelope {
            name: header.msg_name.clone(),
            src_sid: None,
            header,
            body,
        }
    }

    pub fn control(magic: i32, msg: ControlMessage) -> MessageEnvelope {
        MessageEnvelope::new(BaseHeader::new(magic, msg.name()), MessageBody::Control(msg))
    }

    pub fn app(header: BaseHeader, msg: impl AppMessage) -> MessageEnvelope {
        MessageEnvelope::new(header, MessageBody::App(Arc::new(msg)))
    }

    /// an envelope that relays `raw` unchanged behind `header`
    pub fn forward(header: BaseHeader, raw: Bytes) -> MessageEnvelope {
        let mut result = MessageEnvelope::new(header, MessageBody::Forward(raw));
        result.name = BINARY_FORWARD_MSG.to_string();
        result
    }

    pub fn is_forward(&self) -> bool {
        matches!(self.body, MessageBody::Forward(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::TestMessage;

    #[test]
    fn test_app_body_downcast() {
        let envelope = MessageEnvelope::app(BaseHeader::new(1, "test_msg"), TestMessage::new("hi"));
        assert_eq!(envelope.name, "test_msg");
        assert_eq!(envelope.body.app::<TestMessage>().unwrap().text, "hi");
        assert!(envelope.body.app::<crate::message::header::BaseHeader>().is_none());
        assert!(envelope.body.control().is_none());
        assert!(!envelope.is_forward());
    }

    #[test]
    fn test_forward_is_renamed() {
        let envelope = MessageEnvelope::forward(BaseHeader::new(1, "node_list_task_req"), Bytes::from_static(b"raw"));
        assert_eq!(envelope.name, BINARY_FORWARD_MSG);
        assert_eq!(envelope.header.msg_name, "node_list_task_req");
        assert_eq!(envelope.body.forward().unwrap().as_ref(), b"raw");
        assert!(envelope.is_forward());
    }
}
