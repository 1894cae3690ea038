use std::io;
use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use crate::config::TunnelSettings;

/// Port forward kept open by an `ssh -N -L` child process for the lifetime of
/// the value. The child is terminated on drop.
pub struct SshTunnel {
    child: Child,
}

impl SshTunnel {
    pub fn open(settings: &TunnelSettings) -> io::Result<Self> {
        info!(
            "Opening tunnel {} via {}@{}",
            forward_spec(settings),
            settings.user,
            settings.host
        );
        let child = Command::new(&settings.program)
            .args(tunnel_args(settings))
            .stdin(Stdio::null())
            .spawn()?;
        Ok(Self { child })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => warn!("Tunnel process had already exited: {}", status),
            _ => {
                if let Err(e) = self.child.kill() {
                    warn!("Error terminating tunnel process {}: {}", self.child.id(), e);
                }
                let _ = self.child.wait();
                debug!("Tunnel closed");
            }
        }
    }
}

fn forward_spec(settings: &TunnelSettings) -> String {
    format!("{}:{}", settings.local_port, settings.remote)
}

fn tunnel_args(settings: &TunnelSettings) -> Vec<String> {
    vec![
        "-N".to_string(),
        "-L".to_string(),
        forward_spec(settings),
        format!("{}@{}", settings.user, settings.host),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings(program: &str) -> TunnelSettings {
        TunnelSettings {
            program: PathBuf::from(program),
            user: "sync".into(),
            host: "xnat.example.org".into(),
            local_port: 25901,
            remote: "localhost:5432".into(),
        }
    }

    #[test]
    fn test_tunnel_args() {
        assert_eq!(
            tunnel_args(&settings("ssh")),
            vec!["-N", "-L", "25901:localhost:5432", "sync@xnat.example.org"]
        );
    }

    #[test]
    fn test_missing_program_fails_to_open() {
        assert!(SshTunnel::open(&settings("/no/such/ssh")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_drop_reaps_child() {
        let tunnel = SshTunnel::open(&settings("true")).unwrap();
        assert!(tunnel.id() > 0);
        drop(tunnel);
    }
}
