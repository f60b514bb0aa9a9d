use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::codec::{Protocol, ThriftStruct};
use crate::error::{CodecError, CoderError};
use crate::message::control::ControlMessage;
use crate::message::envelope::{AppMessage, MessageBody, BINARY_FORWARD_MSG};

type DecodeInvoker = Box<dyn Fn(&mut dyn Protocol) -> Result<Arc<dyn AppMessage>, CodecError> + Send + Sync>;

/// Maps application message names to their body decoders. Built once at startup and shared
///  read-only afterwards. Control messages are handled by [`ControlMessage`] and need no
///  registration.
#[derive(Default)]
pub struct MessageRegistry {
    decoders: FxHashMap<String, DecodeInvoker>,
}

impl Debug for MessageRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names = self.decoders.keys().collect::<Vec<_>>();
        names.sort();
        write!(f, "MessageRegistry{{{:?}}}", names)
    }
}

impl MessageRegistry {
    pub fn new() -> MessageRegistry {
        Default::default()
    }

    pub fn register<T: ThriftStruct + AppMessage>(&mut self, name: &str) -> anyhow::Result<()> {
        if ControlMessage::is_control_name(name) || name == BINARY_FORWARD_MSG {
            bail!("{} is a reserved message name", name);
        }
        if self.decoders.contains_key(name) {
            bail!("message {} is registered twice", name);
        }

        debug!("registering message {}", name);
        self.decoders.insert(name.to_string(), Box::new(|proto| {
            let msg: Arc<dyn AppMessage> = Arc::new(T::read(proto)?);
            Ok(msg)
        }));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        ControlMessage::is_control_name(name) || self.decoders.contains_key(name)
    }

    pub fn decode_body(&self, name: &str, proto: &mut dyn Protocol) -> Result<MessageBody, CoderError> {
        if let Some(control) = ControlMessage::read_body(name, proto)? {
            return Ok(MessageBody::Control(control));
        }

        match self.decoders.get(name) {
            Some(invoker) => Ok(MessageBody::App(invoker(proto)?)),
            None => Err(CoderError::UnknownMessage(name.to_string())),
        }
    }

    /// Forward bodies are raw bytes and are handled by the packet coder, not here.
    pub fn encode_body(&self, name: &str, body: &MessageBody, proto: &mut dyn Protocol) -> Result<(), CoderError> {
        if !self.contains(name) {
            return Err(CoderError::UnknownMessage(name.to_string()));
        }

        match body {
            MessageBody::Control(msg) => {
                if msg.name() != name {
                    return Err(CoderError::UnknownMessage(name.to_string()));
                }
                msg.write_body(proto)?
            },
            MessageBody::App(msg) => msg.write_body(proto)?,
            MessageBody::Forward(_) => return Err(CoderError::Forward(format!("{} carries a forward body", name))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use crate::codec::binary::BinaryProtocol;
    use crate::codec::ProtocolLimits;
    use crate::message::control::SHAKE_HAND_REQ;
    use crate::test_util::message::TestMessage;

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register::<TestMessage>("test_msg").unwrap();
        registry
    }

    #[test]
    fn test_register_rejects_duplicates_and_reserved_names() {
        let mut registry = registry();
        assert!(registry.register::<TestMessage>("test_msg").is_err());
        assert!(registry.register::<TestMessage>(SHAKE_HAND_REQ).is_err());
        assert!(registry.register::<TestMessage>(BINARY_FORWARD_MSG).is_err());
        assert!(registry.register::<TestMessage>("other_msg").is_ok());
    }

    #[test]
    fn test_encode_decode_app_body() {
        let registry = registry();
        let body = MessageBody::App(Arc::new(TestMessage::new("payload")));

        let mut buf = BytesMut::new();
        registry.encode_body("test_msg", &body, &mut BinaryProtocol::new(&mut buf, ProtocolLimits::unlimited())).unwrap();
        let decoded = registry.decode_body("test_msg", &mut BinaryProtocol::new(&mut buf, ProtocolLimits::unlimited())).unwrap();

        assert_eq!(decoded.app::<TestMessage>().unwrap().text, "payload");
    }

    #[test]
    fn test_control_bodies_need_no_registration() {
        let registry = MessageRegistry::new();
        let body = MessageBody::Control(ControlMessage::ShakeHandReq);

        let mut buf = BytesMut::new();
        registry.encode_body(SHAKE_HAND_REQ, &body, &mut BinaryProtocol::new(&mut buf, ProtocolLimits::unlimited())).unwrap();
        let decoded = registry.decode_body(SHAKE_HAND_REQ, &mut BinaryProtocol::new(&mut buf, ProtocolLimits::unlimited())).unwrap();
        assert_eq!(decoded.control(), Some(&ControlMessage::ShakeHandReq));
    }

    #[test]
    fn test_unknown_name_is_distinct_error() {
        let registry = registry();
        let mut buf = BytesMut::from(&[0u8][..]);

        let err = registry.decode_body("nope", &mut BinaryProtocol::new(&mut buf, ProtocolLimits::unlimited())).unwrap_err();
        assert!(err.is_unknown_message());

        let body = MessageBody::App(Arc::new(TestMessage::new("x")));
        let err = registry.encode_body("nope", &body, &mut BinaryProtocol::new(&mut buf, ProtocolLimits::unlimited())).unwrap_err();
        assert!(err.is_unknown_message());
    }

    #[test]
    fn test_mismatched_control_name() {
        let registry = registry();
        let body = MessageBody::Control(ControlMessage::ShakeHandResp);
        let mut buf = BytesMut::new();
        assert!(registry.encode_body(SHAKE_HAND_REQ, &body, &mut BinaryProtocol::new(&mut buf, ProtocolLimits::unlimited())).is_err());
    }
}
