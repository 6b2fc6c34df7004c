use crate::output::{print_json, print_table};
use clap::Subcommand;
use hopper_core::auth::hash_password;
use hopper_core::config::Config;
use hopper_core::store::{SqliteStore, Store};
use std::path::Path;

use super::load_config;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum UserSubcommand {
    /// Add an API user. Add `admin` first: only it can create users over HTTP
    Add {
        id: String,
        #[arg(long, env = "HOPPER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// List API users
    List,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config_path: &Path, subcmd: UserSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let db_path = Config::resolve(config_path, config.database_path()?);
    let store = SqliteStore::open(&db_path)?;

    match subcmd {
        UserSubcommand::Add { id, password } => add(&store, id.trim(), &password, json),
        UserSubcommand::List => list(&store, json),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn add(store: &SqliteStore, id: &str, password: &str, json: bool) -> anyhow::Result<()> {
    if id.is_empty() || password.is_empty() {
        anyhow::bail!("user id and password must not be empty");
    }
    store.create_user(id, &hash_password(password)?)?;
    if json {
        print_json(&serde_json::json!({ "id": id }))?;
    } else {
        println!("Added user '{id}'");
    }
    Ok(())
}

fn list(store: &SqliteStore, json: bool) -> anyhow::Result<()> {
    let users = store.users()?;
    if json {
        return print_json(&users);
    }
    if users.is_empty() {
        println!("No users.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = users.into_iter().map(|id| vec![id]).collect();
    print_table(&["ID"], &rows);
    Ok(())
}
