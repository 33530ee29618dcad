#![forbid(unsafe_code)]

//! Post-reconciliation script dispatch.
//!
//! Each configured script runs as its own tokio task spawning an external
//! process that receives a JSON payload on stdin. Script failures are logged
//! and never propagate. After the run the dispatcher drains all outstanding
//! tasks against a single 15-minute deadline; scripts still running at the
//! deadline are abandoned, not killed.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ScriptConfig;
use crate::reconciler::PlaylistOutcome;

/// Total time scripts get to finish after the run, shared across all of them.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Payload fields a script can declare in `required_fields`. A script with no
/// declaration receives all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptField {
    /// Videos new to this playlist since the last run.
    New,
    /// Everything absent from the detail lookup this run, with last-known
    /// title and channel info.
    Deleted,
    /// First-time deletions only.
    NewDeleted,
    /// Printf-style watch URL template for the playlist's site.
    UrlFormat,
    PlaylistId,
    PlaylistName,
}

impl ScriptField {
    pub const ALL: &[ScriptField] = &[
        ScriptField::New,
        ScriptField::Deleted,
        ScriptField::NewDeleted,
        ScriptField::UrlFormat,
        ScriptField::PlaylistId,
        ScriptField::PlaylistName,
    ];
}

/// Union of fields requested by a batch of scripts. Drives the lazy
/// computation of expensive payload fields during reconciliation.
pub fn requested_fields(scripts: &[ScriptConfig]) -> HashSet<ScriptField> {
    let mut fields = HashSet::new();
    for script in scripts {
        match &script.required_fields {
            Some(required) => fields.extend(required.iter().copied()),
            // No declaration: the script wants everything.
            None => {
                fields.extend(ScriptField::ALL.iter().copied());
                break;
            }
        }
    }
    fields
}

fn wants(fields: Option<&[ScriptField]>, field: ScriptField) -> bool {
    fields.is_none_or(|fields| fields.contains(&field))
}

/// Builds the JSON payload for one script from a playlist's outcome,
/// restricted to the fields that script asked for.
pub fn build_payload(outcome: &PlaylistOutcome, fields: Option<&[ScriptField]>) -> Value {
    let mut payload = serde_json::Map::new();

    if wants(fields, ScriptField::New) {
        let new: Vec<Value> = outcome
            .changes
            .new
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|id| json!({ "id": id }))
            .collect();
        payload.insert("new".into(), Value::Array(new));
    }
    if wants(fields, ScriptField::Deleted) {
        let deleted: Vec<Value> = outcome
            .changes
            .deleted_details
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|info| {
                json!({
                    "id": info.video_id,
                    "title": info.title,
                    "channel_name": info.channel_name,
                    "channel_id": info.channel_id,
                })
            })
            .collect();
        payload.insert("deleted".into(), Value::Array(deleted));
    }
    if wants(fields, ScriptField::NewDeleted) {
        let newly: Vec<Value> = outcome
            .changes
            .newly_deleted
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|video| json!({ "id": video.video_id, "title": video.title }))
            .collect();
        payload.insert("new_deleted".into(), Value::Array(newly));
    }
    if wants(fields, ScriptField::UrlFormat) {
        payload.insert("url_format".into(), json!(outcome.site.url_format()));
    }
    if wants(fields, ScriptField::PlaylistId) {
        payload.insert("playlist_id".into(), json!(outcome.playlist.playlist_id));
    }
    if wants(fields, ScriptField::PlaylistName) {
        payload.insert("playlist_name".into(), json!(outcome.playlist.name));
    }

    Value::Object(payload)
}

/// Tracks every dispatched script task for the whole run.
#[derive(Debug, Default)]
pub struct Dispatcher {
    units: JoinSet<()>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns one task per script of the playlist, each with its own payload.
    pub fn dispatch_playlist(&mut self, outcome: &PlaylistOutcome) {
        for script in &outcome.scripts {
            let payload = build_payload(outcome, script.required_fields.as_deref());
            self.dispatch(script.clone(), payload);
        }
    }

    pub fn dispatch(&mut self, script: ScriptConfig, payload: Value) {
        let body = payload.to_string();
        debug!(script = %script.name, bytes = body.len(), "dispatching script");
        self.units.spawn(run_script(script, body));
    }

    /// Waits for all outstanding scripts, reaping each as it finishes, up to
    /// one shared deadline. Survivors are logged and left running.
    pub async fn drain(mut self) {
        if self.units.is_empty() {
            return;
        }

        let deadline = Instant::now() + DRAIN_DEADLINE;
        info!(scripts = self.units.len(), "waiting for scripts to finish");
        while !self.units.is_empty() {
            match tokio::time::timeout_at(deadline, self.units.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    error!(
                        remaining = self.units.len(),
                        "scripts still running after drain deadline, abandoning them"
                    );
                    self.units.detach_all();
                    break;
                }
            }
        }
    }
}

/// Splits a command line into arguments, honoring single and double quotes
/// and backslash escapes the way a shell would for a simple command.
fn split_command(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            '\'' => {
                in_arg = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '"' => {
                in_arg = true;
                while let Some(quoted) = chars.next() {
                    match quoted {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.peek()
                                && (next == '"' || next == '\\')
                            {
                                current.push(next);
                                chars.next();
                            } else {
                                current.push('\\');
                            }
                        }
                        _ => current.push(quoted),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            _ => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

async fn run_script(script: ScriptConfig, payload: String) {
    let parts = split_command(&script.script);
    let Some((program, args)) = parts.split_first() else {
        warn!(script = %script.name, "empty script command, skipping");
        return;
    };

    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            error!(script = %script.name, %err, "failed to start script");
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(payload.as_bytes()).await {
            warn!(script = %script.name, %err, "failed to write payload to script");
        }
    }

    match child.wait_with_output().await {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stdout.trim().is_empty() {
                info!(script = %script.name, stdout = %stdout.trim(), "script output");
            }
            if !stderr.trim().is_empty() {
                warn!(script = %script.name, stderr = %stderr.trim(), "script stderr");
            }
            if output.status.success() {
                debug!(script = %script.name, "script finished");
            } else {
                error!(script = %script.name, status = %output.status, "script failed");
            }
        }
        Err(err) => error!(script = %script.name, %err, "failed to wait for script"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ChangeReport;
    use crate::site::Site;
    use crate::store::{DeletedVideoInfo, PlaylistRow, VideoTitle};

    fn script(name: &str, command: &str, fields: Option<Vec<ScriptField>>) -> ScriptConfig {
        ScriptConfig {
            name: name.to_owned(),
            script: command.to_owned(),
            required_fields: fields,
        }
    }

    fn outcome() -> PlaylistOutcome {
        PlaylistOutcome {
            playlist: PlaylistRow {
                id: 1,
                playlist_id: "PL1".into(),
                site: Site::YouTube.id(),
                name: "My list".into(),
            },
            site: Site::YouTube,
            scripts: Vec::new(),
            changes: ChangeReport {
                deleted_ids: vec!["gone".into()],
                new: Some(vec!["fresh".into()]),
                newly_deleted: Some(vec![VideoTitle {
                    video_id: "gone".into(),
                    title: Some("Old title".into()),
                }]),
                deleted_details: Some(vec![DeletedVideoInfo {
                    video_id: "gone".into(),
                    title: Some("Old title".into()),
                    channel_name: Some("Creator".into()),
                    channel_id: Some("chan1".into()),
                }]),
            },
        }
    }

    #[test]
    fn requested_fields_unions_explicit_lists() {
        let scripts = vec![
            script("a", "true", Some(vec![ScriptField::New])),
            script("b", "true", Some(vec![ScriptField::Deleted, ScriptField::UrlFormat])),
        ];
        let fields = requested_fields(&scripts);
        assert_eq!(fields.len(), 3);
        assert!(fields.contains(&ScriptField::New));
        assert!(fields.contains(&ScriptField::Deleted));
        assert!(fields.contains(&ScriptField::UrlFormat));
    }

    #[test]
    fn script_without_declaration_requests_everything() {
        let scripts = vec![
            script("a", "true", Some(vec![ScriptField::New])),
            script("b", "true", None),
        ];
        assert_eq!(requested_fields(&scripts).len(), ScriptField::ALL.len());
    }

    #[test]
    fn no_scripts_request_nothing() {
        assert!(requested_fields(&[]).is_empty());
    }

    #[test]
    fn payload_subset_only_contains_requested_fields() {
        let payload = build_payload(
            &outcome(),
            Some(&[ScriptField::New, ScriptField::UrlFormat]),
        );
        let object = payload.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(payload["new"][0]["id"], "fresh");
        assert_eq!(payload["url_format"], Site::YouTube.url_format());
    }

    #[test]
    fn payload_without_declaration_contains_everything() {
        let payload = build_payload(&outcome(), None);
        let object = payload.as_object().unwrap();
        assert_eq!(object.len(), ScriptField::ALL.len());
        assert_eq!(payload["deleted"][0]["channel_name"], "Creator");
        assert_eq!(payload["new_deleted"][0]["title"], "Old title");
        assert_eq!(payload["playlist_id"], "PL1");
        assert_eq!(payload["playlist_name"], "My list");
    }

    #[test]
    fn split_command_handles_quoting() {
        assert_eq!(split_command("notify-send changed"), vec!["notify-send", "changed"]);
        assert_eq!(
            split_command("sh -c 'cat > /tmp/out.json'"),
            vec!["sh", "-c", "cat > /tmp/out.json"]
        );
        assert_eq!(
            split_command(r#"./hook.sh --title "two words" --flag"#),
            vec!["./hook.sh", "--title", "two words", "--flag"]
        );
        assert_eq!(
            split_command(r#"echo "a \"quoted\" word""#),
            vec!["echo", r#"a "quoted" word"#]
        );
        assert_eq!(split_command(r"echo one\ arg"), vec!["echo", "one arg"]);
        assert_eq!(split_command("   "), Vec::<String>::new());
        assert_eq!(split_command("echo ''"), vec!["echo", ""]);
    }

    #[tokio::test]
    async fn dispatch_pipes_payload_and_drains_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("payload.json");
        let command = format!("sh -c 'cat > {}'", out.display());

        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch(script("sink", &command, None), json!({"new": []}));

        let started = std::time::Instant::now();
        dispatcher.drain().await;
        assert!(started.elapsed() < Duration::from_secs(30));

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&written).unwrap(),
            json!({"new": []})
        );
    }

    #[tokio::test]
    async fn failing_spawn_is_contained() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch(
            script("missing", "/does/not/exist-anywhere", None),
            json!({}),
        );
        dispatcher.dispatch(script("empty", "   ", None), json!({}));
        dispatcher.drain().await;
    }
}
