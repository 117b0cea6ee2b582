use std::path::Path;

use reqwest::Url;

use crate::error::ValidationError;
use crate::fetcher::MeshSelector;

pub const MESH_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub url: Url,
    pub count: u32,
    pub mesh: MeshSelector,
    pub toggle: bool,
}

/// Work the launcher hands to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Cleanup,
    Launch(LaunchRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Run(Task),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Url,
    Agents,
    MeshId,
    Cleanup,
    Toggle,
    Help,
}

impl Action {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "URL" => Some(Self::Url),
            "AGENTS" => Some(Self::Agents),
            "MESHID" => Some(Self::MeshId),
            "CLEANUP" => Some(Self::Cleanup),
            "TOGGLE" => Some(Self::Toggle),
            "HELP" | "-H" | "--HELP" | "/?" => Some(Self::Help),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Url => "URL",
            Self::Agents => "AGENTS",
            Self::MeshId => "MESHID",
            Self::Cleanup => "CLEANUP",
            Self::Toggle => "TOGGLE",
            Self::Help => "HELP",
        }
    }

    fn takes_value(self) -> bool {
        matches!(self, Self::Url | Self::Agents | Self::MeshId)
    }
}

#[derive(Default)]
struct RawArgs {
    url: Option<String>,
    agents: Option<String>,
    mesh_id: Option<String>,
    cleanup: bool,
    toggle: bool,
    help: bool,
}

/// Turns the argument list (without the program name) into a validated
/// command. Pure apart from checking that a `.txt` MESHID exists.
pub fn parse<I, S>(args: I) -> Result<Command, ValidationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
    if args.is_empty() {
        return Err(ValidationError::Empty);
    }

    let mut raw = RawArgs::default();
    let mut it = args.into_iter();
    while let Some(token) = it.next() {
        let action =
            Action::parse(&token).ok_or_else(|| ValidationError::UnknownAction(token.clone()))?;

        if !action.takes_value() {
            let flag = match action {
                Action::Cleanup => &mut raw.cleanup,
                Action::Toggle => &mut raw.toggle,
                _ => &mut raw.help,
            };
            if *flag {
                return Err(ValidationError::Duplicate(action.name()));
            }
            *flag = true;
            continue;
        }

        let value = it
            .next()
            .filter(|v| Action::parse(v).is_none())
            .ok_or(ValidationError::MissingValue(action.name()))?;
        let slot = match action {
            Action::Url => &mut raw.url,
            Action::Agents => &mut raw.agents,
            _ => &mut raw.mesh_id,
        };
        if slot.is_some() {
            return Err(ValidationError::Duplicate(action.name()));
        }
        *slot = Some(value);
    }

    if raw.help {
        return Ok(Command::Help);
    }

    if raw.cleanup {
        for (present, name) in [
            (raw.url.is_some(), "URL"),
            (raw.agents.is_some(), "AGENTS"),
            (raw.mesh_id.is_some(), "MESHID"),
            (raw.toggle, "TOGGLE"),
        ] {
            if present {
                return Err(ValidationError::CleanupExclusive(name));
            }
        }
        return Ok(Command::Run(Task::Cleanup));
    }

    let url = raw.url.ok_or(ValidationError::MissingAction("URL"))?;
    let agents = raw.agents.ok_or(ValidationError::MissingAction("AGENTS"))?;
    let mesh_id = raw.mesh_id.ok_or(ValidationError::MissingAction("MESHID"))?;

    Ok(Command::Run(Task::Launch(LaunchRequest {
        url: parse_url(&url)?,
        count: parse_count(&agents)?,
        mesh: parse_mesh(&mesh_id)?,
        toggle: raw.toggle,
    })))
}

fn parse_url(raw: &str) -> Result<Url, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidUrl {
        value: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

fn parse_count(raw: &str) -> Result<u32, ValidationError> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ValidationError::InvalidCount(raw.to_string())),
    }
}

fn parse_mesh(raw: &str) -> Result<MeshSelector, ValidationError> {
    let value = raw.trim();
    if value.to_ascii_lowercase().ends_with(".txt") {
        if !Path::new(value).is_file() {
            return Err(ValidationError::MeshFileMissing(value.into()));
        }
        return Ok(MeshSelector(value.to_string()));
    }
    if value.chars().count() != MESH_ID_LEN || value.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidMeshId(raw.to_string()));
    }
    Ok(MeshSelector(value.to_string()))
}

pub fn usage() -> String {
    format!(
        "\
Agent Launcher for MeshCentral. Version: {version}

Usage:
  agentlauncher [action] [value] ...

Actions (case-insensitive):
  URL <url>        MeshCentral server to download the agent and policy from.
                   Example: URL https://mesh.example.com
  AGENTS <count>   Number of agent instances to launch locally.
                   Example: AGENTS 10
  MESHID <id>      64-character mesh identifier, or a .txt file containing it.
                   Example: MESHID meshid.txt
  TOGGLE           Restart agents one at a time on SIGHUP.
  CLEANUP          Remove all downloaded agents and instance directories.
                   Do not combine with other actions.
  HELP             Show this text.

Environment:
  AGENTLAUNCHER_ROOT              base directory (default: current directory)
  AGENTLAUNCHER_HTTP_TIMEOUT_SEC  download timeout (default: 300)
  AGENTLAUNCHER_EARLY_EXIT_MS     agents exiting sooner count as failed (default: 2000)
  AGENTLAUNCHER_STOP_GRACE_SEC    wait before killing agents on shutdown (default: 5)
  RUST_LOG                        log filter (default: info)
",
        version = env!("CARGO_PKG_VERSION")
    )
}
