use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use super::{ObjectStore, TransportError};
use crate::remote::{shell_quote, ProcessError};

/// [ObjectStore] uploading through the AWS command line client.
///
/// Every object is streamed into `aws s3 cp - s3://{bucket}/{key}`, so
/// credentials, retries and multipart uploads are the client's business.
#[derive(Debug, Clone)]
pub struct S3CliStore {
    program: PathBuf,
    profile: Option<String>,
    region: Option<String>,
    endpoint_url: Option<String>,
}

impl Default for S3CliStore {
    fn default() -> Self {
        Self {
            program: "aws".into(),
            profile: None,
            region: None,
            endpoint_url: None,
        }
    }
}

impl S3CliStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client binary, `aws` from `PATH` by default.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = non_empty(profile);
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = non_empty(region);
        self
    }

    /// For S3 compatible services other than AWS.
    pub fn with_endpoint_url(mut self, endpoint_url: Option<String>) -> Self {
        self.endpoint_url = non_empty(endpoint_url);
        self
    }

    fn args(&self, url: String) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, value) in [
            ("--profile", &self.profile),
            ("--region", &self.region),
            ("--endpoint-url", &self.endpoint_url),
        ] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
        args.extend(["s3", "cp", "--only-show-errors", "-"].map(String::from));
        args.push(url);
        args
    }

    fn render(&self, args: &[String]) -> String {
        std::iter::once(shell_quote(&self.program.to_string_lossy()))
            .chain(args.iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn object_url(bucket: &str, key: &str) -> Option<String> {
    let valid_bucket = !bucket.is_empty() && !bucket.contains('/');
    let valid_key = !key.is_empty() && !key.starts_with('/') && !key.split('/').any(str::is_empty);
    (valid_bucket && valid_key).then(|| format!("s3://{bucket}/{key}"))
}

/// What became of a child fed through its stdin.
struct Piped {
    written: u64,
    copied: io::Result<()>,
    status: ExitStatus,
    stderr: String,
}

/// Feeds `body` to the child's stdin and waits for it.
///
/// stderr is drained on its own thread so a chatty client can't block the upload.
fn pipe_through(
    mut command: Command,
    rendered: &str,
    body: &mut dyn Read,
) -> Result<Piped, ProcessError> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Launch {
            command: rendered.to_string(),
            source,
        })?;

    let stderr = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        })
    });

    let copied = match child.stdin.take() {
        Some(mut stdin) => io::copy(body, &mut stdin),
        None => Err(io::Error::other("stdin of the client isn't piped")),
    };
    let (written, copy_result) = match copied {
        Ok(written) => (written, Ok(())),
        Err(e) => (0, Err(e)),
    };

    let status = child.wait().map_err(|source| ProcessError::Launch {
        command: rendered.to_string(),
        source,
    })?;
    let stderr = stderr
        .and_then(|reader| reader.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).trim_end().to_string())
        .unwrap_or_default();

    Ok(Piped {
        written,
        copied: copy_result,
        status,
        stderr,
    })
}

impl ObjectStore for S3CliStore {
    fn upload(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64, TransportError> {
        let url = object_url(bucket, key)
            .ok_or_else(|| TransportError::InvalidKey(format!("{bucket}/{key}")))?;
        let args = self.args(url);
        let rendered = self.render(&args);
        log::debug!(target: "storage::s3", "Running: {rendered}");

        let command_failure = |source: ProcessError| TransportError::Command {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        };

        let mut command = Command::new(&self.program);
        command.args(&args);
        let piped = pipe_through(command, &rendered, body).map_err(command_failure)?;

        // the exit status explains a broken pipe better than the pipe itself
        if !piped.status.success() {
            return Err(command_failure(ProcessError::Failed {
                command: rendered,
                status: piped.status,
                stderr: piped.stderr,
            }));
        }
        if let Err(source) = piped.copied {
            return Err(TransportError::Stream {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source,
            });
        }
        if !piped.stderr.is_empty() {
            log::warn!(target: "storage::s3", "{}: {}", self.program.display(), piped.stderr);
        }

        Ok(piped.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_built_from_bucket_and_key() {
        assert_eq!(
            object_url("backups", "web/shop/web_shop_2024-05-01.sql").as_deref(),
            Some("s3://backups/web/shop/web_shop_2024-05-01.sql")
        );
        assert_eq!(object_url("", "a"), None);
        assert_eq!(object_url("a/b", "c"), None);
        assert_eq!(object_url("a", "/c"), None);
        assert_eq!(object_url("a", "b//c"), None);
    }

    #[test]
    fn client_options_precede_the_copy() {
        let store = S3CliStore::new()
            .with_profile(Some("backup".into()))
            .with_region(Some(" ".into()))
            .with_endpoint_url(Some("https://minio.internal:9000".into()));

        assert_eq!(
            store.args("s3://b/k".into()),
            [
                "--profile",
                "backup",
                "--endpoint-url",
                "https://minio.internal:9000",
                "s3",
                "cp",
                "--only-show-errors",
                "-",
                "s3://b/k",
            ]
        );
    }

    #[test]
    fn invalid_key_is_not_uploaded() {
        let store = S3CliStore::new().with_program("/nonexistent/aws");

        assert!(matches!(
            store.upload("b", "", &mut &b"x"[..]),
            Err(TransportError::InvalidKey(_))
        ));
    }

    #[test]
    fn missing_client_fails_to_launch() {
        let store = S3CliStore::new().with_program("/nonexistent/aws");

        let err = store.upload("b", "k", &mut &b"x"[..]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Command {
                source: ProcessError::Launch { .. },
                ..
            }
        ));
    }

    #[test]
    fn failing_client_reports_its_status() {
        let store = S3CliStore::new().with_program("false");

        let err = store.upload("b", "k", &mut &b"payload"[..]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Command {
                source: ProcessError::Failed { .. },
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn body_is_streamed_to_the_client() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let client = dir.path().join("aws");
        fs::write(
            &client,
            "#!/bin/sh\nd=$(dirname \"$0\")\nprintf '%s\\n' \"$@\" > \"$d/args\"\ncat > \"$d/body\"\n",
        )
        .unwrap();
        fs::set_permissions(&client, fs::Permissions::from_mode(0o755)).unwrap();
        let store = S3CliStore::new().with_program(&client);

        let written = store
            .upload("backups", "web/shop/dump.sql", &mut &b"-- dump"[..])
            .unwrap();

        assert_eq!(written, 7);
        assert_eq!(fs::read(dir.path().join("body")).unwrap(), b"-- dump");
        assert_eq!(
            fs::read_to_string(dir.path().join("args")).unwrap(),
            "s3\ncp\n--only-show-errors\n-\ns3://backups/web/shop/dump.sql\n"
        );
    }
}
