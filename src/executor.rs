/*!
The command run inside a forked child.

The service never interprets a request's argv itself: it hands argv and the environment
overlay to an `Executor` supplied by the embedding application, inside the child, after the
standard streams have been rebound to the client's FIFOs and the overlay has been applied
to the process environment.
*/
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use crate::errors::exit_code_for_io_error;
use crate::protocol::EnvOverlay;

pub trait Executor {
    /// Run the requested command to completion and return its exit code.
    fn execute(&self, argv: &[String], env: &EnvOverlay) -> i32;
}

impl<F> Executor for F
where
    F: Fn(&[String], &EnvOverlay) -> i32,
{
    fn execute(&self, argv: &[String], env: &EnvOverlay) -> i32 {
        self(argv, env)
    }
}

/// Runs `argv[0]` as a subprocess inheriting the child's (redirected) stdio and environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn execute(&self, argv: &[String], _env: &EnvOverlay) -> i32 {
        let Some((program, args)) = argv.split_first() else {
            return 2;
        };
        match Command::new(program).args(args).status() {
            Ok(status) => match (status.code(), status.signal()) {
                (Some(code), _) => code,
                (None, Some(sig)) => 128 + sig,
                (None, None) => 1,
            },
            Err(e) => {
                eprintln!("forking-service: {program}: {e}");
                i32::from(exit_code_for_io_error(&e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_process_executor_exit_codes() {
        let ex = ProcessExecutor;
        let env = EnvOverlay::new();
        assert_eq!(ex.execute(&argv(&["sh", "-c", "exit 0"]), &env), 0);
        assert_eq!(ex.execute(&argv(&["sh", "-c", "exit 3"]), &env), 3);
        assert_eq!(ex.execute(&argv(&["sh", "-c", "kill -9 $$"]), &env), 137);
        assert_eq!(
            ex.execute(&argv(&["/nonexistent/forking-service-cmd"]), &env),
            127
        );
        assert_eq!(ex.execute(&[], &env), 2);
    }

    #[test]
    fn test_closure_executor() {
        let ex = |argv: &[String], env: &EnvOverlay| -> i32 { (argv.len() + env.len()) as i32 };
        let mut env = EnvOverlay::new();
        env.insert("A".into(), Some("1".into()));
        assert_eq!(ex.execute(&argv(&["x", "y"]), &env), 3);
    }
}
