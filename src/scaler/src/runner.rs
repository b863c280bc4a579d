// Copyright 2025 CloudTik Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The process runner seam: how remote commands leave the core.
//!
//! The runner carries no cluster semantics. Node updaters hand it fully
//! formed `ssh`/`rsync` argument vectors; implementations either spawn the
//! processes or, in tests, record them.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ScaleError, ScaleResult};

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the command, failing with [`ScaleError::CommandFailed`] on a
    /// non-zero exit.
    async fn check_call(&self, cmd: &[String]) -> ScaleResult<()>;

    /// As `check_call`, capturing stdout.
    async fn check_output(&self, cmd: &[String]) -> ScaleResult<Vec<u8>>;
}

/// Runner spawning real local processes. `check_call` streams the child's
/// output straight through; `check_output` captures stdout.
pub struct ExecProcessRunner;

fn split_program(cmd: &[String]) -> ScaleResult<(&String, &[String])> {
    cmd.split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command").into())
}

fn check_status(status: std::process::ExitStatus, cmd: &[String]) -> ScaleResult<()> {
    if status.success() {
        Ok(())
    } else {
        Err(ScaleError::CommandFailed {
            code: status.code().unwrap_or(-1),
            cmd: cmd.to_vec(),
        })
    }
}

#[async_trait]
impl ProcessRunner for ExecProcessRunner {
    async fn check_call(&self, cmd: &[String]) -> ScaleResult<()> {
        let (program, args) = split_program(cmd)?;
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", program, e))?;
        check_status(status, cmd)
    }

    async fn check_output(&self, cmd: &[String]) -> ScaleResult<Vec<u8>> {
        let (program, args) = split_program(cmd)?;
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", program, e))?;
        check_status(output.status, cmd)?;
        Ok(output.stdout)
    }
}

type HookPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;
type HookAction = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct MockRunnerCore {
    calls: Vec<Vec<String>>,
    fail_cmds: Vec<String>,
    responses: Vec<(String, VecDeque<Vec<u8>>)>,
}

/// Recording runner for tests.
///
/// Commands containing a registered fail token fail deterministically.
/// `(predicate, action)` hooks fire before the failure check and can be
/// used to simulate background events during a node update, e.g. a node
/// disconnecting mid-setup.
#[derive(Default)]
pub struct MockProcessRunner {
    core: Mutex<MockRunnerCore>,
    hooks: Mutex<Vec<(HookPredicate, HookAction)>>,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_cmds(&self, tokens: Vec<String>) {
        self.core.lock().fail_cmds = tokens;
    }

    pub fn add_hook(
        &self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
        action: impl Fn() + Send + Sync + 'static,
    ) {
        self.hooks
            .lock()
            .push((Box::new(predicate), Box::new(action)));
    }

    /// Queues canned stdout for commands containing `pattern`; each
    /// matching call consumes one entry.
    pub fn respond_to_call(&self, pattern: &str, responses: Vec<Vec<u8>>) {
        self.core
            .lock()
            .responses
            .push((pattern.to_string(), responses.into()));
    }

    pub fn command_history(&self) -> Vec<String> {
        self.core
            .lock()
            .calls
            .iter()
            .map(|cmd| cmd.join(" "))
            .collect()
    }

    pub fn clear_history(&self) {
        self.core.lock().calls.clear();
    }

    pub fn call_count(&self) -> usize {
        self.core.lock().calls.len()
    }

    /// True iff some recorded command mentions `ip` and contains `pattern`.
    pub fn has_call(&self, ip: &str, pattern: &str) -> bool {
        self.command_history()
            .iter()
            .any(|cmd| cmd.contains(ip) && cmd.contains(pattern))
    }

    fn record(&self, cmd: &[String]) -> ScaleResult<()> {
        let joined = cmd.join(" ");
        for (predicate, action) in self.hooks.lock().iter() {
            if predicate(&joined) {
                action();
            }
        }
        let mut core = self.core.lock();
        core.calls.push(cmd.to_vec());
        for token in &core.fail_cmds {
            if joined.contains(token.as_str()) {
                return Err(ScaleError::CommandFailed {
                    code: 1,
                    cmd: cmd.to_vec(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn check_call(&self, cmd: &[String]) -> ScaleResult<()> {
        self.record(cmd)
    }

    async fn check_output(&self, cmd: &[String]) -> ScaleResult<Vec<u8>> {
        self.record(cmd)?;
        let joined = cmd.join(" ");
        let mut core = self.core.lock();
        for (pattern, queue) in &mut core.responses {
            if joined.contains(pattern.as_str()) {
                if let Some(response) = queue.pop_front() {
                    return Ok(response);
                }
            }
        }
        Ok(b"command-output".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fail_tokens() {
        let runner = MockProcessRunner::new();
        runner.fail_cmds(vec!["setup_cmd".to_string()]);
        assert!(runner.check_call(&argv(&["ssh", "init_cmd"])).await.is_ok());
        let err = runner
            .check_call(&argv(&["ssh", "setup_cmd"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::CommandFailed { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_hooks_fire_on_matching_commands() {
        let runner = MockProcessRunner::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_hook = fired.clone();
        runner.add_hook(
            |cmd| cmd.contains("start_cmd"),
            move || {
                fired_in_hook.fetch_add(1, Ordering::SeqCst);
            },
        );
        runner.check_call(&argv(&["ssh", "setup_cmd"])).await.unwrap();
        runner.check_call(&argv(&["ssh", "start_cmd"])).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canned_responses_are_consumed_in_order() {
        let runner = MockProcessRunner::new();
        runner.respond_to_call("uptime", vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(
            runner.check_output(&argv(&["ssh", "uptime"])).await.unwrap(),
            b"first"
        );
        assert_eq!(
            runner.check_output(&argv(&["ssh", "uptime"])).await.unwrap(),
            b"second"
        );
        assert_eq!(
            runner.check_output(&argv(&["ssh", "uptime"])).await.unwrap(),
            b"command-output"
        );
    }
}
