use std::sync::{Arc, Mutex};

/// Metrics sink. Values are only ever written, never read back by the training loop.
pub trait Logger: Send {
    fn add_scalar(&mut self, key: &str, value: f64, step: usize);

    fn message(&mut self, text: &str);
}

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn add_scalar(&mut self, key: &str, value: f64, step: usize) {
        tracing::info!(target: "tempora::metrics", key, value, step);
    }

    fn message(&mut self, text: &str) {
        tracing::info!(target: "tempora::metrics", "{text}");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn add_scalar(&mut self, _key: &str, _value: f64, _step: usize) {}

    fn message(&mut self, _text: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    pub key: String,
    pub value: f64,
    pub step: usize,
}

#[derive(Debug, Default)]
struct Records {
    scalars: Vec<Scalar>,
    messages: Vec<String>,
}

/// Keeps every record in memory. Clones share the same records, so a handle can be kept
/// after the logger itself has been moved into a trainer.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogger {
    records: Arc<Mutex<Records>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut Records) -> T) -> T {
        match self.records.lock() {
            Ok(mut records) => f(&mut records),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn scalars(&self) -> Vec<Scalar> {
        self.with_records(|records| records.scalars.clone())
    }

    /// Every value logged under `key`, in logging order.
    pub fn values(&self, key: &str) -> Vec<f64> {
        self.with_records(|records| {
            records
                .scalars
                .iter()
                .filter(|scalar| scalar.key == key)
                .map(|scalar| scalar.value)
                .collect()
        })
    }

    pub fn last(&self, key: &str) -> Option<Scalar> {
        self.with_records(|records| {
            records
                .scalars
                .iter()
                .rev()
                .find(|scalar| scalar.key == key)
                .cloned()
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.with_records(|records| records.messages.clone())
    }
}

impl Logger for MemoryLogger {
    fn add_scalar(&mut self, key: &str, value: f64, step: usize) {
        self.with_records(|records| {
            records.scalars.push(Scalar {
                key: key.to_owned(),
                value,
                step,
            })
        })
    }

    fn message(&mut self, text: &str) {
        self.with_records(|records| records.messages.push(text.to_owned()))
    }
}

impl<L: Logger + ?Sized> Logger for Box<L> {
    fn add_scalar(&mut self, key: &str, value: f64, step: usize) {
        (**self).add_scalar(key, value, step)
    }

    fn message(&mut self, text: &str) {
        (**self).message(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_logger_handles_share_records() {
        let handle = MemoryLogger::new();
        let mut logger: Box<dyn Logger> = Box::new(handle.clone());
        logger.add_scalar("loss/policy", 0.5, 1);
        logger.add_scalar("loss/policy", 0.25, 2);
        logger.message("done");
        assert_eq!(handle.values("loss/policy"), vec![0.5, 0.25]);
        assert_eq!(handle.last("loss/policy").map(|s| s.step), Some(2));
        assert_eq!(handle.messages(), vec!["done".to_owned()]);
        assert!(handle.last("loss/critic").is_none());
    }
}
