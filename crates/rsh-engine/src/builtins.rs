use std::path::{Path, PathBuf};

pub const HELP_TEXT: &str = "\
rsh - remote command shell

Operators:
  cmd1 ; cmd2        run cmd1, then cmd2
  cmd1 | cmd2        pipe cmd1's output into cmd2
  cmd < file         read input from file
  cmd > file         write output to file (truncate)
  cmd >> file        append output to file
  \\c                 treat character c literally

Built-in commands:
  cd <path>          change this session's working directory
  help               show this text
  halt               shut down the server and every session
  quit               close this session
  stat               list active connections
  abort <id>         disconnect connection <id>
";

/// Commands handled in-process, without spawning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    Cd,
    Help,
    Halt,
}

impl Builtin {
    pub fn lookup(program: &str) -> Option<Self> {
        match program {
            "cd" => Some(Self::Cd),
            "help" => Some(Self::Help),
            "halt" => Some(Self::Halt),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CdError {
    #[error("cd: missing argument")]
    MissingArgument,

    #[error("cd: directory doesn't exist")]
    NoSuchDirectory,
}

/// Resolve the new working directory for `cd target` issued from `cwd`.
pub async fn change_directory(cwd: &Path, target: Option<&str>) -> Result<PathBuf, CdError> {
    let target = target.ok_or(CdError::MissingArgument)?;
    let resolved = tokio::fs::canonicalize(cwd.join(target))
        .await
        .map_err(|_| CdError::NoSuchDirectory)?;
    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_dir() => Ok(resolved),
        _ => Err(CdError::NoSuchDirectory),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_recognizes_builtins_only() {
        assert_eq!(Builtin::lookup("cd"), Some(Builtin::Cd));
        assert_eq!(Builtin::lookup("help"), Some(Builtin::Help));
        assert_eq!(Builtin::lookup("halt"), Some(Builtin::Halt));
        assert_eq!(Builtin::lookup("stat"), None);
        assert_eq!(Builtin::lookup("ls"), None);
    }

    #[tokio::test]
    async fn cd_to_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let resolved = change_directory(dir.path(), Some("sub")).await.unwrap();
        assert_eq!(resolved, dir.path().join("sub").canonicalize().unwrap());
    }

    #[tokio::test]
    async fn cd_parent_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let resolved = change_directory(&sub, Some("..")).await.unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn cd_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), "x").unwrap();
        assert_eq!(change_directory(dir.path(), None).await, Err(CdError::MissingArgument));
        assert_eq!(
            change_directory(dir.path(), Some("/does/not/exist")).await,
            Err(CdError::NoSuchDirectory)
        );
        assert_eq!(
            change_directory(dir.path(), Some("file")).await,
            Err(CdError::NoSuchDirectory)
        );
    }

    #[test]
    fn help_mentions_every_verb() {
        for verb in ["cd", "help", "halt", "quit", "stat", "abort"] {
            assert!(HELP_TEXT.contains(verb), "missing {verb}");
        }
    }
}
