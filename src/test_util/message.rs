use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};

use crate::codec::{required, Protocol, TType, ThriftStruct};
use crate::error::CodecError;
use crate::message::envelope::MessageEnvelope;
use crate::message::header::BaseHeader;
use crate::net::channel_handler::MessageSink;

pub const TEST_MSG: &str = "test_msg";
pub const TEST_MAGIC: i32 = 0x7e57;

/// A minimal application message: `struct test_msg { 1: required string text, 2: i64 seq }`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestMessage {
    pub text: String,
    pub seq: i64,
}

impl TestMessage {
    pub fn new(text: &str) -> TestMessage {
        TestMessage {
            text: text.to_string(),
            seq: 0,
        }
    }

    pub fn envelope(text: &str, seq: i64) -> MessageEnvelope {
        MessageEnvelope::app(BaseHeader::new(TEST_MAGIC, TEST_MSG), TestMessage { text: text.to_string(), seq })
    }
}

impl ThriftStruct for TestMessage {
    fn write(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        proto.write_struct_begin("test_msg")?;
        proto.write_field_begin("text", TType::String, 1)?;
        proto.write_string(&self.text)?;
        proto.write_field_end()?;
        proto.write_field_begin("seq", TType::I64, 2)?;
        proto.write_i64(self.seq)?;
        proto.write_field_end()?;
        proto.write_field_stop()?;
        proto.write_struct_end()
    }

    fn read(proto: &mut dyn Protocol) -> Result<TestMessage, CodecError> {
        let mut text = None;
        let mut seq = 0;
        proto.read_struct_begin()?;
        loop {
            let field = proto.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (1, TType::String) => text = Some(proto.read_string()?),
                (2, TType::I64) => seq = proto.read_i64()?,
                (_, t) => proto.skip(t)?,
            }
            proto.read_field_end()?;
        }
        proto.read_struct_end()?;
        Ok(TestMessage {
            text: required(text, "test_msg", "text")?,
            seq,
        })
    }
}

/// Records every delivered message for later assertions
#[derive(Debug, Default)]
pub struct TrackingMessageSink {
    delivered: RwLock<Vec<(String, MessageEnvelope)>>,
    notify: Notify,
}

impl TrackingMessageSink {
    pub fn new() -> Arc<TrackingMessageSink> {
        Default::default()
    }

    pub async fn delivered(&self) -> Vec<(String, MessageEnvelope)> {
        self.delivered.read().await.clone()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.delivered.read().await
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// waits until at least `count` messages were delivered, panicking after `timeout`
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(String, MessageEnvelope)> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                {
                    let delivered = self.delivered.read().await;
                    if delivered.len() >= count {
                        return delivered.clone();
                    }
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(delivered) => delivered,
            Err(_) => panic!("expected {} delivered messages, got {:?}", count, self.topics().await),
        }
    }
}

#[async_trait]
impl MessageSink for TrackingMessageSink {
    async fn deliver(&self, topic: &str, msg: MessageEnvelope) {
        self.delivered.write().await
            .push((topic.to_string(), msg));
        self.notify.notify_waiters();
    }
}
