use std::{
    env,
    io::{self, Write},
    process::{Command, Stdio},
};

use chrono::Local;

use calendar_offline::{
    calendar::Event,
    storage::{
        asset_cache::{AssetCache, HttpAssetFetcher},
        mutation_store::{Mutation, PendingMutation},
    },
    sync::sync_engine::{DrainOutcome, SyncEngine},
};

use crate::Services;

pub const USAGE: &str =
    "Usage: calendar-offline [--status | --drain | --agenda | --install-assets | --help]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliMode {
    Run,
    Status,
    Drain,
    Agenda,
    InstallAssets,
    Help,
}

pub fn parse_cli_mode() -> Result<CliMode, String> {
    parse_args(env::args().skip(1))
}

pub fn parse_args<I>(args: I) -> Result<CliMode, String>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = None;

    for arg in args {
        let next = match arg.as_str() {
            "--status" => CliMode::Status,
            "--drain" => CliMode::Drain,
            "--agenda" => CliMode::Agenda,
            "--install-assets" => CliMode::InstallAssets,
            "--help" | "-h" => return Ok(CliMode::Help),
            _ => return Err(format!("Unknown argument: {}", arg)),
        };
        if let Some(previous) = mode
            && previous != next
        {
            return Err(format!("Conflicting modes: {:?} and {:?}", previous, next));
        }
        mode = Some(next);
    }

    Ok(mode.unwrap_or(CliMode::Run))
}

pub async fn run_status_mode(services: &Services) -> anyhow::Result<()> {
    let pending = services.engine.store().get_all().await?;
    let online = services.engine.monitor().is_online();

    println!("{}", if online { "Online" } else { "Offline" });
    if pending.is_empty() {
        println!("No pending changes.");
        return Ok(());
    }

    println!("{} pending change(s):", pending.len());
    for entry in &pending {
        println!("  {}", format_pending_line(entry));
    }
    Ok(())
}

pub async fn run_drain_mode(services: &Services) -> anyhow::Result<()> {
    match services.engine.drain().await? {
        DrainOutcome::Completed(report) => {
            println!(
                "Replayed {} change(s), {} still pending.",
                report.replayed, report.remaining
            );
            if let Some(reason) = report.stopped {
                println!("Stopped early: {:?}", reason);
            }
        }
        DrainOutcome::AlreadyDraining => println!("A drain is already running."),
    }
    Ok(())
}

pub async fn run_agenda_mode(services: &Services) -> anyhow::Result<()> {
    let events = load_agenda(&services.engine).await?;
    let agenda = format_agenda_text(&events, services.engine.monitor().is_online());
    display_with_pager(&agenda)?;
    Ok(())
}

pub async fn run_install_assets_mode(services: &Services) -> anyhow::Result<()> {
    let cache = AssetCache::open(
        &services.config.storage.database_path,
        services.config.assets.clone(),
    )?;
    let fetcher = HttpAssetFetcher::new(&services.config.remote.base_url, services.client.clone());

    let count = cache.install(&fetcher).await?;
    println!("Cached {} resource(s) as {}.", count, cache.version());

    for removed in cache.activate().await? {
        println!("Removed stale cache {}.", removed);
    }
    Ok(())
}

async fn load_agenda(engine: &SyncEngine) -> anyhow::Result<Vec<Event>> {
    if engine.monitor().is_online() {
        match engine.refresh_events().await {
            Ok(events) => return Ok(events),
            Err(e) => {
                eprintln!("Failed to fetch events: {}", e);
                tracing::warn!("Agenda refresh failed, showing local changes only: {}", e);
            }
        }
    }

    let pending = engine.store().get_all().await?;
    engine.book().replace_from_remote(Vec::new(), &pending);
    Ok(engine.book().snapshot())
}

fn format_pending_line(entry: &PendingMutation) -> String {
    let queued = entry.queued_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
    let detail = match &entry.mutation {
        Mutation::Upsert(event) => format!("save \"{}\"", event.title),
        Mutation::Delete { id } => format!("delete #{}", id),
    };
    format!("#{:<4} {:<44} {} ({})", entry.local_key, entry.event_key, detail, queued)
}

fn format_agenda_text(events: &[Event], online: bool) -> String {
    let mut lines = Vec::new();
    lines.push(if online {
        "Agenda".to_string()
    } else {
        "Agenda (offline, local changes only)".to_string()
    });
    lines.push(String::new());

    if events.is_empty() {
        lines.push("No events scheduled.".to_string());
    } else {
        for event in events {
            lines.push(format!("- {}", build_agenda_line(event)));
        }
    }

    lines.join("\n")
}

fn build_agenda_line(event: &Event) -> String {
    let start_local = event.start.with_timezone(&Local);
    let end_local = event.effective_end().with_timezone(&Local);

    let mut line = format!(
        "{} {}-{} {}",
        start_local.format("%Y-%m-%d"),
        start_local.format("%H:%M"),
        end_local.format("%H:%M"),
        event.title
    );
    if event.is_draft() {
        line.push_str(" [not synced]");
    }
    line
}

fn display_with_pager(text: &str) -> Result<(), io::Error> {
    let pager_value = env::var("PAGER").unwrap_or_else(|_| "less".to_string());
    let mut parts = pager_value.split_whitespace();
    let cmd = match parts.next() {
        Some(c) => c,
        None => {
            println!("{text}");
            return Ok(());
        }
    };
    let args: Vec<&str> = parts.collect();

    match Command::new(cmd).args(&args).stdin(Stdio::piped()).spawn() {
        Ok(mut child) => {
            if let Some(stdin) = child.stdin.as_mut() {
                stdin.write_all(text.as_bytes())?;
            }
            let _ = child.wait();
        }
        Err(_) => {
            println!("{text}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_runs_the_service() {
        assert_eq!(parse_args(args(&[])), Ok(CliMode::Run));
    }

    #[test]
    fn recognizes_each_mode() {
        assert_eq!(parse_args(args(&["--status"])), Ok(CliMode::Status));
        assert_eq!(parse_args(args(&["--drain"])), Ok(CliMode::Drain));
        assert_eq!(parse_args(args(&["--agenda"])), Ok(CliMode::Agenda));
        assert_eq!(parse_args(args(&["--install-assets"])), Ok(CliMode::InstallAssets));
        assert_eq!(parse_args(args(&["--drain", "--help"])), Ok(CliMode::Help));
    }

    #[test]
    fn rejects_unknown_and_conflicting_arguments() {
        assert!(parse_args(args(&["--sample"])).is_err());
        assert!(parse_args(args(&["--status", "--drain"])).is_err());
        assert_eq!(parse_args(args(&["--drain", "--drain"])), Ok(CliMode::Drain));
    }

    #[test]
    fn agenda_marks_unsynced_events() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let synced = Event::new("Standup", start).with_remote_id(42);
        let draft = Event::new("Offline draft", start);

        let text = format_agenda_text(&[synced, draft], false);

        assert!(text.starts_with("Agenda (offline"));
        assert!(text.contains("Standup\n") || text.ends_with("Standup"));
        assert!(text.contains("Offline draft [not synced]"));
    }

    #[test]
    fn empty_agenda_says_so() {
        let text = format_agenda_text(&[], true);
        assert!(text.contains("No events scheduled."));
    }
}
