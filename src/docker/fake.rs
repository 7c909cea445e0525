use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use super::{ContainerRuntime, LogStream};
use crate::error::{FleetError, Result};

/// In-memory runtime for orchestrator and backup tests.
///
/// Records every call as `"<op>:<id>"`. Individual operations can be made to
/// fail per instance with [`FakeRuntime::fail`].
#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    running: Mutex<HashSet<String>>,
    exec_output: Mutex<String>,
    log_lines: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.set_exec_output("[]");
        fake
    }

    pub fn fail(&self, op: &str, id: &str) {
        self.failing.lock().unwrap().insert(format!("{op}:{id}"));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn set_exec_output(&self, output: &str) {
        *self.exec_output.lock().unwrap() = output.to_string();
    }

    pub fn set_log_lines(&self, lines: &[&str]) {
        *self.log_lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op}:");
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.lock().unwrap().contains(id)
    }

    fn record(&self, op: &str, id: &str) -> Result<()> {
        let key = format!("{op}:{id}");
        self.calls.lock().unwrap().push(key.clone());
        if self.failing.lock().unwrap().contains(&key) {
            return Err(FleetError::external(
                format!("fake {op} {id}"),
                "simulated failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, id: &str) -> Result<()> {
        self.record("start", id)?;
        self.running.lock().unwrap().insert(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.record("stop", id)?;
        self.running.lock().unwrap().remove(id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record("remove", id)?;
        self.running.lock().unwrap().remove(id);
        Ok(())
    }

    async fn init(&self, id: &str) -> Result<String> {
        self.record("init", id)?;
        Ok(format!("onboarded {id}\n"))
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        self.record("logs", id)?;
        Ok(LogStream::from_lines(self.log_lines.lock().unwrap().clone()))
    }

    async fn exec_json(&self, id: &str, args: &[&str], token: &str) -> Result<String> {
        self.record("exec", id)?;
        self.calls
            .lock()
            .unwrap()
            .push(format!("exec-args:{} --token {}", args.join(" "), token));
        Ok(self.exec_output.lock().unwrap().clone())
    }

    async fn container_state(&self, id: &str) -> Result<String> {
        self.record("state", id)?;
        Ok(if self.is_running(id) {
            "running".to_string()
        } else {
            "not_created".to_string()
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}
