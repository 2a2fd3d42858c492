//! 测试替身集合：供本 crate 与传输实现的测试复用。
//!
//! 这些替身刻意保持最小实现——透传编解码、手动调度、记录型订阅者——
//! 用来在不引入真实传输的情况下验证契约行为。

use crate::callback::{Observer, Scheduler};
use crate::codec::{Message, MessageCodec};
use crate::error::{ErrorCategory, Fault, QuiverError};
use crate::Result;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// 透传编解码器：消息负载即帧负载。
#[derive(Debug, Default)]
pub struct IdentityCodec;

impl MessageCodec for IdentityCodec {
    fn encode(&self, message: &Message) -> Result<Bytes> {
        Ok(message.payload().clone())
    }

    fn decode(&self, frame: Bytes) -> Result<Message> {
        Ok(Message::from_payload(frame))
    }
}

/// 手动调度器：积压执行单元，由测试显式放行。
///
/// 用于验证“解除附着先于已调度单元执行”之类的时序契约。
#[derive(Default)]
pub struct ManualScheduler {
    units: Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

impl ManualScheduler {
    /// 创建空调度器。
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 当前积压的单元数。
    pub fn pending(&self) -> usize {
        self.units.lock().map(|units| units.len()).unwrap_or(0)
    }

    /// 依次执行所有积压单元（含执行过程中新产生的）。
    pub fn run_all(&self) {
        loop {
            let unit = {
                let mut units = match self.units.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if units.is_empty() {
                    return;
                }
                units.remove(0)
            };
            unit();
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, unit: Box<dyn FnOnce() + Send + 'static>) {
        match self.units.lock() {
            Ok(mut units) => units.push(unit),
            Err(poisoned) => poisoned.into_inner().push(unit),
        }
    }
}

/// 记录型订阅者：把收到的通知按顺序写进共享日志。
pub struct RecordingObserver {
    log: Arc<Mutex<Vec<String>>>,
    fail_on_value: bool,
}

impl RecordingObserver {
    /// 正常记录的订阅者。
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            fail_on_value: false,
        }
    }

    /// 在 `on_value` 上必然失败的订阅者，用于升级路径测试。
    pub fn failing_on_value() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            fail_on_value: true,
        }
    }

    /// 共享日志句柄。
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for RecordingObserver {
    type Item = u32;

    fn on_value(&mut self, value: u32) -> Result<()> {
        if self.fail_on_value {
            return Err(QuiverError::new(
                "quiver.test_stubs.observer_rejects",
                "observer rejects value",
            )
            .with_category(ErrorCategory::Execution));
        }
        self.log.lock().unwrap().push(format!("value:{value}"));
        Ok(())
    }

    fn on_fault(&mut self, fault: Fault) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("fault:{}", fault.error().code()));
        Ok(())
    }

    fn on_completed(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("completed".to_string());
        Ok(())
    }
}
