//! Subprocess execution.
//!
//! Clients that drive external management tools go through
//! [`CommandRunner`] so their argument construction and output parsing can
//! be exercised without the tools installed.

use log::debug;
use std::process::Command;

use crate::controller::ProviderError;

/// Runs a program and returns its stdout
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ProviderError>;
}

/// Runs commands on the local host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ProviderError> {
        let command = render_command(program, args);
        debug!("Running `{}`", command);

        let output = Command::new(program).args(args).output().map_err(|e| ProviderError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = match output.status.code() {
                Some(code) => format!("exit status {}: {}", code, stderr),
                None => format!("terminated by signal: {}", stderr),
            };
            return Err(ProviderError::Command { command, message });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Render a command line for logs and error messages
pub fn render_command(program: &str, args: &[&str]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Scripted runner for tests: responses are matched by command-line prefix
/// and every invocation is recorded.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Vec<(String, Result<String, String>)>,
        pub calls: RefCell<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(mut self, prefix: &str, stdout: &str) -> Self {
            self.responses.push((prefix.to_string(), Ok(stdout.to_string())));
            self
        }

        pub fn fail(mut self, prefix: &str, message: &str) -> Self {
            self.responses.push((prefix.to_string(), Err(message.to_string())));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<String, ProviderError> {
            let command = render_command(program, args);
            self.calls.borrow_mut().push(command.clone());
            // Longest matching prefix wins.
            let matched = self
                .responses
                .iter()
                .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            match matched {
                Some((_, Ok(stdout))) => Ok(stdout.clone()),
                Some((_, Err(message))) => Err(ProviderError::Command { command, message: message.clone() }),
                None => Ok(String::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedRunner;
    use super::*;

    #[test]
    fn test_render_command() {
        assert_eq!(render_command("ip", &["-j", "route", "show"]), "ip -j route show");
        assert_eq!(render_command("true", &[]), "true");
    }

    #[test]
    fn test_scripted_runner_prefers_longest_prefix() {
        let runner = ScriptedRunner::new()
            .respond("pvesh get", "[]")
            .respond("pvesh get /cluster/sdn/zones", "[{\"zone\":\"a\",\"type\":\"simple\"}]")
            .fail("pvesh delete", "boom");
        assert_eq!(runner.run("pvesh", &["get", "/cluster/sdn/vnets"]).unwrap(), "[]");
        assert!(runner.run("pvesh", &["get", "/cluster/sdn/zones"]).unwrap().contains("simple"));
        assert!(runner.run("pvesh", &["delete", "/x"]).is_err());
        assert_eq!(runner.calls().len(), 3);
    }
}
