use crate::output::{or_dash, print_json, print_table};
use clap::Subcommand;
use hopper_core::config::Config;
use hopper_core::store::{NewRegistration, SqliteStore, Store};
use std::path::Path;

use super::load_config;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum RegistrationSubcommand {
    /// Start an image for batches of a topic
    Add {
        topic: String,
        /// Image run for each batch
        image: String,
        /// Buffered files that trigger a batch
        #[arg(long)]
        threshold: Option<u32>,
        /// Seconds a non-empty inbox may wait before a batch is forced
        #[arg(long)]
        timeout: Option<u64>,
        /// Run the container privileged
        #[arg(long)]
        privileged: bool,
    },

    /// List registrations
    List {
        /// Only registrations of this topic
        #[arg(long)]
        topic: Option<String>,
    },

    /// Remove a registration by id
    Remove { id: i64 },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config_path: &Path, subcmd: RegistrationSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let db_path = Config::resolve(config_path, config.database_path()?);
    let store = SqliteStore::open(&db_path)?;

    match subcmd {
        RegistrationSubcommand::Add {
            topic,
            image,
            threshold,
            timeout,
            privileged,
        } => {
            let mut new = NewRegistration::new(topic, image).privileged(privileged);
            new.threshold = threshold;
            new.timeout = timeout;
            new.validate()?;
            add(&store, &new, json)
        }
        RegistrationSubcommand::List { topic } => list(&store, topic.as_deref(), json),
        RegistrationSubcommand::Remove { id } => remove(&store, id, json),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn add(store: &SqliteStore, new: &NewRegistration, json: bool) -> anyhow::Result<()> {
    let created = store.create_registration(new)?;
    if json {
        print_json(&created)?;
    } else {
        println!(
            "Registered '{}' for topic '{}' (id {})",
            created.container, created.topic, created.id
        );
    }
    Ok(())
}

fn list(store: &SqliteStore, topic: Option<&str>, json: bool) -> anyhow::Result<()> {
    let registrations = match topic {
        Some(topic) => store.registrations_for_topic(topic)?,
        None => store.registrations()?,
    };

    if json {
        return print_json(&registrations);
    }
    if registrations.is_empty() {
        println!("No registrations.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = registrations
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.topic.clone(),
                r.container.clone(),
                or_dash(r.threshold),
                or_dash(r.timeout),
                r.privileged.to_string(),
            ]
        })
        .collect();
    print_table(
        &["ID", "TOPIC", "IMAGE", "THRESHOLD", "TIMEOUT", "PRIVILEGED"],
        &rows,
    );
    Ok(())
}

fn remove(store: &SqliteStore, id: i64, json: bool) -> anyhow::Result<()> {
    let removed = store.delete_registration(id)?;
    if json {
        print_json(&removed)?;
    } else {
        println!("Removed registration {} ('{}' on '{}')", removed.id, removed.container, removed.topic);
    }
    Ok(())
}
