use crate::output::{print_json, print_table};
use clap::Subcommand;
use hopper_core::config::Config;
use hopper_core::inbox::Inbox;
use std::path::{Path, PathBuf};

use super::load_config;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum InboxSubcommand {
    /// Move files into a topic's inbox
    ///
    /// Writes the inbox directly instead of going through a running server.
    /// Sequence numbers never clash with the server's, but the server is not
    /// told: the files are picked up with its next event on the topic, or
    /// when it starts.
    Add {
        topic: String,
        /// Files to move; each becomes one inbox entry
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List the files buffered for a topic, or every topic with its count
    List { topic: Option<String> },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config_path: &Path, subcmd: InboxSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let inbox = Inbox::open(
        Config::resolve(config_path, &config.inbox.master),
        Config::resolve(config_path, &config.inbox.containers),
    )?;

    match subcmd {
        InboxSubcommand::Add { topic, files } => add(&inbox, &topic, &files, json),
        InboxSubcommand::List { topic: Some(topic) } => list(&inbox, &topic, json),
        InboxSubcommand::List { topic: None } => list_topics(&inbox, json),
    }
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

fn add(inbox: &Inbox, topic: &str, files: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let mut added = Vec::with_capacity(files.len());
    for file in files {
        let seq = inbox.add_path(topic, file)?;
        added.push(serde_json::json!({ "file": file, "sequence": seq }));
        if !json {
            println!("{} -> {topic}/{seq}", file.display());
        }
    }

    if json {
        print_json(&serde_json::json!({ "topic": topic, "added": added }))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list(inbox: &Inbox, topic: &str, json: bool) -> anyhow::Result<()> {
    let files = inbox.list(topic)?;
    if json {
        return print_json(&serde_json::json!({
            "topic": topic,
            "count": files.len(),
            "files": files,
        }));
    }

    if files.is_empty() {
        println!("Inbox '{topic}' is empty.");
    } else {
        for file in &files {
            println!("{file}");
        }
    }
    Ok(())
}

fn list_topics(inbox: &Inbox, json: bool) -> anyhow::Result<()> {
    let topics = inbox.topics()?;
    let counts: Vec<(String, usize)> = topics
        .into_iter()
        .map(|topic| {
            let count = inbox.count(&topic);
            (topic, count)
        })
        .collect();

    if json {
        let value: Vec<_> = counts
            .iter()
            .map(|(topic, count)| serde_json::json!({ "topic": topic, "count": count }))
            .collect();
        return print_json(&value);
    }

    if counts.is_empty() {
        println!("No topics.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = counts
        .iter()
        .map(|(topic, count)| vec![topic.clone(), count.to_string()])
        .collect();
    print_table(&["TOPIC", "FILES"], &rows);
    Ok(())
}
