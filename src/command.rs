use crate::{
    error::Error,
    handler::ProcessHandler,
    process::{self, ProcessHandle, SpawnSpec},
};
use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

/// Child process builder.
///
/// ```no_run
/// use procmux::{Command, ProcessHandler, PipeBuf, ExitStatus};
///
/// struct Quiet;
/// impl ProcessHandler for Quiet {
///     fn on_stdout(&mut self, buf: &mut PipeBuf, _closed: bool) {
///         let n = buf.remaining();
///         buf.consume(n);
///     }
///     fn on_stderr(&mut self, buf: &mut PipeBuf, _closed: bool) {
///         let n = buf.remaining();
///         buf.consume(n);
///     }
///     fn on_exit(&mut self, _status: ExitStatus) {}
/// }
///
/// let child = Command::new("cat").spawn(Box::new(Quiet)).unwrap();
/// child.close_stdin();
/// ```
#[derive(Debug)]
pub struct Command {
    program: OsString,
    argv: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    inherit_env: bool,
    current_dir: Option<PathBuf>,
}

impl Command {
    pub fn new(program: impl AsRef<OsStr>) -> Command {
        Command {
            program: program.as_ref().to_os_string(),
            argv: Vec::new(),
            env: Vec::new(),
            inherit_env: true,
            current_dir: None,
        }
    }

    pub fn arg(&mut self, a: impl AsRef<OsStr>) -> &mut Self {
        self.argv.push(a.as_ref().to_os_string());
        self
    }

    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut Self {
        self.argv
            .extend(args.into_iter().map(|s| s.as_ref().to_os_string()));
        self
    }

    /// Sets one environment variable for the child. Overrides an inherited
    /// variable of the same name.
    pub fn env(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn envs(
        &mut self,
        items: impl IntoIterator<Item = (impl AsRef<OsStr>, impl AsRef<OsStr>)>,
    ) -> &mut Self {
        self.env.extend(
            items
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string())),
        );
        self
    }

    /// Starts the child from an empty environment instead of inheriting
    /// the parent's.
    pub fn env_clear(&mut self) -> &mut Self {
        self.inherit_env = false;
        self.env.clear();
        self
    }

    pub fn current_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.current_dir.replace(dir.as_ref().to_path_buf());
        self
    }

    /// Launches the child and hands its streams to an event loop.
    ///
    /// OS-level launch failures are reported both as the returned error and
    /// through the handler's `on_exit` with a spawn-failure status.
    pub fn spawn(&mut self, handler: Box<dyn ProcessHandler>) -> Result<ProcessHandle, Error> {
        if self.program.is_empty() {
            return Err(Error::InvalidCommand {
                reason: "empty program name",
            });
        }
        let spec = SpawnSpec {
            program: self.program.clone(),
            args: self.argv.clone(),
            env: canonical_environment(self.inherit_env, &self.env),
            cwd: self.current_dir.clone(),
        };
        process::spawn(spec, handler)
    }
}

/// Merges inherited and explicit variables and sorts them by a
/// case-insensitive collation of the key (uppercased code-unit
/// comparison), the canonical order both platforms emit.
fn canonical_environment(
    inherit: bool,
    overrides: &[(OsString, OsString)],
) -> Vec<(OsString, OsString)> {
    let mut vars: Vec<(OsString, OsString)> = if inherit {
        std::env::vars_os().collect()
    } else {
        Vec::new()
    };
    for (key, value) in overrides {
        if let Some(existing) = vars.iter_mut().find(|(k, _)| k == key) {
            existing.1 = value.clone();
        } else {
            vars.push((key.clone(), value.clone()));
        }
    }
    vars.sort_by(|(a, _), (b, _)| collation_key(a).cmp(&collation_key(b)));
    vars
}

fn collation_key(key: &OsStr) -> Vec<char> {
    key.to_string_lossy()
        .chars()
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(vars: &[(OsString, OsString)]) -> Vec<String> {
        vars.iter()
            .map(|(k, _)| k.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn environment_sorts_case_insensitively() {
        let vars = canonical_environment(
            false,
            &[
                ("path".into(), "1".into()),
                ("COMSPEC".into(), "2".into()),
                ("Home".into(), "3".into()),
                ("aaa".into(), "4".into()),
            ],
        );
        assert_eq!(keys(&vars), vec!["aaa", "COMSPEC", "Home", "path"]);
    }

    #[test]
    fn later_override_wins() {
        let vars = canonical_environment(
            false,
            &[("A".into(), "1".into()), ("A".into(), "2".into())],
        );
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].1, OsString::from("2"));
    }

    #[test]
    fn override_replaces_inherited_value() {
        std::env::set_var("PROCMUX_COLLATION_PROBE", "inherited");
        let vars = canonical_environment(
            true,
            &[("PROCMUX_COLLATION_PROBE".into(), "explicit".into())],
        );
        let probe = vars
            .iter()
            .find(|(k, _)| k == "PROCMUX_COLLATION_PROBE")
            .unwrap();
        assert_eq!(probe.1, OsString::from("explicit"));
        std::env::remove_var("PROCMUX_COLLATION_PROBE");
    }
}
