//! Remote state introspection.
//!
//! Lists services, containers, images and nginx sites by running a listing
//! command on the session's host and parsing its output. Parsers are lenient:
//! a line that does not have the expected shape is skipped, never an error.
//! A listing command that exits non-zero is tolerated when it still produced
//! parseable output.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::broker::ConnectionBroker;
use super::error::{RelayError, Result, classify_elevation_failure, elevation_error};
use super::registry::SessionRecord;
use super::remote::CommandOutput;

/// Bound on one listing command
const LISTING_TIMEOUT: Duration = Duration::from_secs(30);

const LIST_UNITS_COMMAND: &str =
    "systemctl list-units --type=service --all --no-legend --no-pager --plain";
const LIST_UNIT_FILES_COMMAND: &str =
    "systemctl list-unit-files --type=service --no-legend --no-pager";
const DOCKER_PS_COMMAND: &str =
    r"docker ps -a --format '{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.ID}}\t{{.State}}'";
const DOCKER_IMAGES_COMMAND: &str =
    r"docker images --format '{{.Repository}}:{{.Tag}}\t{{.ID}}\t{{.Size}}'";
const SITES_ENABLED_DIR: &str = "/etc/nginx/sites-enabled";
const SITES_AVAILABLE_DIR: &str = "/etc/nginx/sites-available";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// `enabled`, `disabled`, `static`... when listed from unit files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_file_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ServiceEntry {
    fn rank(&self) -> u8 {
        let is = |field: &Option<String>, value: &str| field.as_deref() == Some(value);
        if is(&self.active, "active") && (is(&self.sub, "running") || is(&self.sub, "exited")) {
            0
        } else if is(&self.active, "failed")
            || is(&self.sub, "failed")
            || is(&self.unit_file_state, "failed")
        {
            1
        } else {
            2
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEntry {
    pub name: String,
    pub image: String,
    pub status: String,
    pub id: String,
    /// `running`, `exited`, `created`...
    pub state: String,
}

impl ContainerEntry {
    fn rank(&self) -> u8 {
        match self.state.as_str() {
            "running" => 0,
            "exited" => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub reference: String,
    pub id: String,
    pub size: String,
}

/// Strip the status bullet systemd prints in front of failed units.
fn strip_bullet(line: &str) -> &str {
    line.trim_start()
        .trim_start_matches(['●', '*', '○'])
        .trim_start()
}

/// Parse `systemctl list-units --plain --no-legend` output.
pub fn parse_units(output: &str) -> Vec<ServiceEntry> {
    let mut services: Vec<ServiceEntry> = output
        .lines()
        .filter_map(|line| {
            let mut fields = strip_bullet(line).split_whitespace();
            let name = fields.next()?;
            if !name.ends_with(".service") {
                return None;
            }
            let load = fields.next()?;
            let active = fields.next()?;
            let sub = fields.next()?;
            let description = fields.collect::<Vec<_>>().join(" ");
            Some(ServiceEntry {
                name: name.to_string(),
                load: Some(load.to_string()),
                active: Some(active.to_string()),
                sub: Some(sub.to_string()),
                unit_file_state: None,
                description: (!description.is_empty()).then_some(description),
            })
        })
        .collect();
    services.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.name.cmp(&b.name)));
    services
}

/// Parse `systemctl list-unit-files --no-legend` output.
pub fn parse_unit_files(output: &str) -> Vec<ServiceEntry> {
    let mut services: Vec<ServiceEntry> = output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            if !name.ends_with(".service") {
                return None;
            }
            let state = fields.next()?;
            Some(ServiceEntry {
                name: name.to_string(),
                load: None,
                active: None,
                sub: None,
                unit_file_state: Some(state.to_string()),
                description: None,
            })
        })
        .collect();
    services.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.name.cmp(&b.name)));
    services
}

/// Parse tab-separated `docker ps` output (name, image, status, id, state).
///
/// Older engines have no `State` placeholder; the state is then derived from
/// the status text.
pub fn parse_containers(output: &str) -> Vec<ContainerEntry> {
    let mut containers: Vec<ContainerEntry> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
            if fields.len() < 4 || fields[0].trim().is_empty() || fields[3].trim().is_empty() {
                return None;
            }
            let status = fields[2].trim();
            let state = match fields.get(4).map(|s| s.trim()).filter(|s| !s.is_empty()) {
                Some(state) => state.to_lowercase(),
                None if status.starts_with("Up") => "running".to_string(),
                None if status.starts_with("Exited") => "exited".to_string(),
                None => "unknown".to_string(),
            };
            Some(ContainerEntry {
                name: fields[0].trim().to_string(),
                image: fields[1].trim().to_string(),
                status: status.to_string(),
                id: fields[3].trim().to_string(),
                state,
            })
        })
        .collect();
    containers.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.name.cmp(&b.name)));
    containers
}

/// Parse tab-separated `docker images` output (reference, id, size).
pub fn parse_images(output: &str) -> Vec<ImageEntry> {
    let mut images: Vec<ImageEntry> = output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim_end_matches('\r').split('\t').map(str::trim);
            let reference = fields.next().filter(|r| !r.is_empty())?;
            let id = fields.next().filter(|i| !i.is_empty())?;
            let size = fields.next()?;
            Some(ImageEntry {
                reference: reference.to_string(),
                id: id.to_string(),
                size: size.to_string(),
            })
        })
        .collect();
    images.sort_by(|a, b| a.reference.cmp(&b.reference));
    images
}

/// Parse a one-name-per-line directory listing.
pub fn parse_sites(output: &str) -> Vec<String> {
    let mut sites: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .collect();
    sites.sort();
    sites.dedup();
    sites
}

fn docker_socket_denied(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("permission denied")
        && (lower.contains("docker.sock") || lower.contains("docker daemon socket"))
}

/// Turn a listing result into entries, tolerating failures that still produced output.
fn tolerate<T>(output: CommandOutput, what: &str, parse: impl Fn(&str) -> Vec<T>) -> Result<Vec<T>> {
    let entries = parse(&output.stdout_text());
    if output.success() || !entries.is_empty() {
        return Ok(entries);
    }
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        Ok(entries)
    } else {
        Err(RelayError::Remote(format!("{}: {}", what, stderr)))
    }
}

pub struct Introspector {
    broker: Arc<ConnectionBroker>,
}

impl Introspector {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self { broker }
    }

    async fn run(&self, session: &SessionRecord, command: &str) -> Result<CommandOutput> {
        let host = self.broker.get_or_connect(&session.id).await?;
        host.run(command, None, LISTING_TIMEOUT).await
    }

    /// Run a docker listing, retrying through `sudo -n` when the daemon socket is denied.
    async fn run_docker(
        &self,
        session: &SessionRecord,
        command: &str,
        what: &str,
    ) -> Result<CommandOutput> {
        let output = self.run(session, command).await?;
        if output.success() || !docker_socket_denied(&output.stderr) {
            return Ok(output);
        }

        debug!("Docker socket denied on session {}, retrying with sudo", session.id);
        let elevated = self.run(session, &format!("sudo -n {}", command)).await?;
        if !elevated.success()
            && let Some(issue) = classify_elevation_failure(&elevated.stderr)
        {
            return Err(elevation_error(issue, &session.username, what));
        }
        Ok(elevated)
    }

    pub async fn list_services(&self, session: &SessionRecord) -> Result<Vec<ServiceEntry>> {
        let units = self.run(session, LIST_UNITS_COMMAND).await?;
        let parsed = parse_units(&units.stdout_text());
        if units.success() && !parsed.is_empty() {
            return Ok(parsed);
        }

        debug!(
            "Unit listing on session {} gave {} entries (exit {:?}), trying unit files",
            session.id,
            parsed.len(),
            units.exit_code
        );
        let files = self.run(session, LIST_UNIT_FILES_COMMAND).await?;
        let from_files = tolerate(files, "list services", parse_unit_files)?;
        if from_files.is_empty() && !parsed.is_empty() {
            return Ok(parsed);
        }
        Ok(from_files)
    }

    pub async fn list_docker_containers(
        &self,
        session: &SessionRecord,
    ) -> Result<Vec<ContainerEntry>> {
        let output = self
            .run_docker(session, DOCKER_PS_COMMAND, "list docker containers")
            .await?;
        tolerate(output, "list docker containers", parse_containers)
    }

    pub async fn list_docker_images(&self, session: &SessionRecord) -> Result<Vec<ImageEntry>> {
        let output = self
            .run_docker(session, DOCKER_IMAGES_COMMAND, "list docker images")
            .await?;
        tolerate(output, "list docker images", parse_images)
    }

    /// Sites in `sites-enabled`, or `sites-available` when `available` is set.
    pub async fn list_nginx_sites(
        &self,
        session: &SessionRecord,
        available: bool,
    ) -> Result<Vec<String>> {
        let dir = if available {
            SITES_AVAILABLE_DIR
        } else {
            SITES_ENABLED_DIR
        };
        let output = self.run(session, &format!("ls -1A {}", dir)).await?;
        tolerate(output, "list nginx sites", parse_sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod services {
        use super::*;

        #[test]
        fn test_units_sorted_by_rank_then_name() {
            let output = "\
zeta.service loaded active running Zeta daemon
cron.service loaded active running Regular background program processing daemon
● broken.service loaded failed failed Broken thing
setup.service loaded active exited One-shot setup
apache.service loaded inactive dead Apache
dev-sda.device loaded active plugged Disk
  UNIT LOAD ACTIVE SUB DESCRIPTION
";
            let names: Vec<String> = parse_units(output).into_iter().map(|s| s.name).collect();
            assert_eq!(
                names,
                vec![
                    "cron.service",
                    "setup.service",
                    "zeta.service",
                    "broken.service",
                    "apache.service"
                ]
            );
        }

        #[test]
        fn test_unit_fields() {
            let services = parse_units("ssh.service loaded active running OpenBSD Secure Shell server\n");
            assert_eq!(
                services[0],
                ServiceEntry {
                    name: "ssh.service".to_string(),
                    load: Some("loaded".to_string()),
                    active: Some("active".to_string()),
                    sub: Some("running".to_string()),
                    unit_file_state: None,
                    description: Some("OpenBSD Secure Shell server".to_string()),
                }
            );
        }

        #[test]
        fn test_truncated_lines_are_skipped() {
            assert!(parse_units("nginx.service loaded\n\n").is_empty());
        }

        #[test]
        fn test_unit_files() {
            let output = "\
ssh.service enabled enabled
getty@.service enabled enabled
apt-daily.timer enabled enabled
rescue.service static -
";
            let services = parse_unit_files(output);
            let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["getty@.service", "rescue.service", "ssh.service"]);
            assert_eq!(services[1].unit_file_state.as_deref(), Some("static"));
        }
    }

    mod docker {
        use super::*;

        #[test]
        fn test_containers_running_then_exited_then_other() {
            let output = "\
web\tnginx:1.25\tUp 2 hours\tabc123\trunning
db\tpostgres:16\tExited (0) 3 days ago\tdef456\texited
api\tapp:latest\tUp 5 minutes\t0aa111\trunning
init\tbusybox\tCreated\t999fff\tcreated
garbage line
";
            let names: Vec<String> = parse_containers(output)
                .into_iter()
                .map(|c| c.name)
                .collect();
            assert_eq!(names, vec!["api", "web", "db", "init"]);
        }

        #[test]
        fn test_state_derived_from_status_without_state_column() {
            let containers = parse_containers("old\talpine\tExited (1) 2 weeks ago\tfeed01\n");
            assert_eq!(containers[0].state, "exited");
        }

        #[test]
        fn test_images_sorted_by_reference() {
            let output = "\
redis:7\tsha256:2\t130MB
alpine:3.20\tsha256:1\t7.8MB
\tbroken\t1MB
";
            let images = parse_images(output);
            assert_eq!(images.len(), 2);
            assert_eq!(images[0].reference, "alpine:3.20");
            assert_eq!(images[1].size, "130MB");
        }

        #[test]
        fn test_socket_denied_detection() {
            assert!(docker_socket_denied(
                "permission denied while trying to connect to the Docker daemon socket at unix:///var/run/docker.sock"
            ));
            assert!(!docker_socket_denied("Cannot connect to the Docker daemon. Is it running?"));
        }
    }

    mod sites {
        use super::*;

        #[test]
        fn test_filters_dot_entries_and_blanks() {
            assert_eq!(
                parse_sites("default\n.\n..\n\nexample.com\n  api.conf  \n"),
                vec!["api.conf", "default", "example.com"]
            );
        }
    }

    mod failure_policy {
        use super::*;

        #[test]
        fn test_nonzero_exit_with_output_is_tolerated() {
            let output = CommandOutput {
                stdout: b"default\n".to_vec(),
                stderr: "ls: something odd".to_string(),
                exit_code: Some(2),
            };
            assert_eq!(tolerate(output, "list", parse_sites).unwrap(), vec!["default"]);
        }

        #[test]
        fn test_failure_without_output_is_an_error() {
            let output = CommandOutput {
                stdout: Vec::new(),
                stderr: "ls: cannot access '/etc/nginx/sites-enabled': No such file or directory"
                    .to_string(),
                exit_code: Some(2),
            };
            assert!(matches!(
                tolerate(output, "list", parse_sites),
                Err(RelayError::Remote(_))
            ));
        }
    }

    mod commands {
        use super::*;
        use crate::relay::external::MemoryProfileStore;
        use crate::relay::registry::{AuthKind, MemorySessionRegistry, NewSession};
        use crate::relay::remote::Credential;
        use crate::relay::testing::MockConnector;

        async fn fixture() -> (Arc<MockConnector>, Introspector, SessionRecord) {
            let connector = Arc::new(MockConnector::new());
            let broker = ConnectionBroker::new(
                connector.clone(),
                Arc::new(MemorySessionRegistry::new(Duration::from_secs(1800))),
                Arc::new(MemoryProfileStore::new()),
            );
            let session = broker
                .open_session(
                    NewSession {
                        owner_id: None,
                        host: "web.internal".to_string(),
                        port: 22,
                        username: "deploy".to_string(),
                        auth_kind: AuthKind::Password,
                        profile_id: None,
                        cwd: None,
                        hostname: None,
                    },
                    &Credential::Password("secret".to_string()),
                    None,
                )
                .await
                .unwrap();
            (connector, Introspector::new(broker), session)
        }

        #[tokio::test]
        async fn test_services_fall_back_to_unit_files() {
            let (connector, introspector, session) = fixture().await;
            connector.on_run("list-units", "", "Failed to connect to bus", 1);
            connector.on_run("list-unit-files", "ssh.service enabled enabled\n", "", 0);

            let services = introspector.list_services(&session).await.unwrap();

            assert_eq!(services.len(), 1);
            assert_eq!(services[0].unit_file_state.as_deref(), Some("enabled"));
        }

        #[tokio::test]
        async fn test_docker_retries_with_sudo_when_socket_denied() {
            let (connector, introspector, session) = fixture().await;
            connector.on_run(
                "sudo -n docker ps",
                "web\tnginx\tUp 1 hour\tabc\trunning\n",
                "",
                0,
            );
            connector.on_run(
                "docker ps",
                "",
                "permission denied while trying to connect to the Docker daemon socket at unix:///var/run/docker.sock",
                1,
            );

            let containers = introspector.list_docker_containers(&session).await.unwrap();

            assert_eq!(containers.len(), 1);
            assert!(connector.commands().iter().any(|c| c.starts_with("sudo -n docker ps")));
        }

        #[tokio::test]
        async fn test_sites_enabled_and_available() {
            let (connector, introspector, session) = fixture().await;
            connector.on_run("sites-enabled", "default\n", "", 0);
            connector.on_run("sites-available", "default\nstaging\n", "", 0);

            assert_eq!(
                introspector.list_nginx_sites(&session, false).await.unwrap(),
                vec!["default"]
            );
            assert_eq!(
                introspector.list_nginx_sites(&session, true).await.unwrap(),
                vec!["default", "staging"]
            );
        }
    }
}
