//! Scripted launcher for unit tests

use async_trait::async_trait;
use command_executor::{
    Command, ExitStatus, Launcher, ProcessEvent, ProcessEventType, ProcessHandle, Result, Target,
};
use futures::stream;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct Rule {
    pattern: String,
    code: i32,
    output: String,
}

/// Answers commands from a list of `(substring, exit code, output)` rules
/// and records every command line it was asked to run. Unmatched commands
/// succeed with no output.
#[derive(Clone, Default)]
pub(crate) struct ScriptedLauncher {
    rules: Vec<Rule>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(mut self, pattern: &str, code: i32, output: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            code,
            output: output.to_string(),
        });
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

pub(crate) struct ScriptedHandle {
    code: i32,
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(ExitStatus {
            code: Some(self.code),
            signal: None,
        })
    }

    async fn terminate(&mut self) -> Result<()> {
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    type Target = Target;
    type EventStream = stream::Iter<std::vec::IntoIter<ProcessEvent>>;
    type Handle = ScriptedHandle;

    async fn launch(
        &self,
        _target: &Self::Target,
        command: Command,
    ) -> Result<(Self::EventStream, Self::Handle)> {
        let line = command.to_string();
        self.calls.lock().unwrap().push(line.clone());

        let (code, output) = self
            .rules
            .iter()
            .find(|rule| line.contains(&rule.pattern))
            .map_or((0, ""), |rule| (rule.code, rule.output.as_str()));

        let events: Vec<ProcessEvent> = output
            .lines()
            .map(|l| ProcessEvent::new_with_data(ProcessEventType::Stdout, l.to_string()))
            .collect();

        Ok((stream::iter(events), ScriptedHandle { code }))
    }
}
