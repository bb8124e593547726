//! HashHello
//!
//! Command-line front end for the local account: identity, contacts, chat
//! history and backups.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use messenger::config::Config;
use messenger::protocol::{Identity, Message, NumericId, Sender};
use messenger::storage::{BackupBundle, PendingImport, SecureStorage, StorageError};
use messenger::ContactBook;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted before prompting for the master password.
const PASSWORD_ENV: &str = "HASHHELLO_PASSWORD";

/// HashHello - end-to-end encrypted peer-to-peer messenger.
#[derive(Parser, Debug)]
#[command(name = "hashhello")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate a new identity and protect it with a master password
    Init,

    /// Log in with an existing login credential
    Login {
        /// Base64 login credential
        credential: String,
    },

    /// Show the local numeric id
    Whoami,

    /// Print the login credential (contains the private key)
    Credential,

    /// Manage contact names
    #[command(subcommand)]
    Contacts(ContactsCommands),

    /// List chats, most recent first
    Chats,

    /// Show the message history with a peer
    History {
        /// Peer numeric id, e.g. "#123 456 789"
        peer: String,
    },

    /// Write a plaintext backup of the account
    Export {
        /// Output file
        file: PathBuf,
    },

    /// Restore an account from a backup file
    Import {
        /// Backup file
        file: PathBuf,
    },

    /// Delete every stored key and message
    Forget {
        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
}

/// Subcommands for contact management.
#[derive(Subcommand, Debug, Clone)]
pub enum ContactsCommands {
    /// List all contacts
    List,

    /// Name a peer
    Add {
        /// Peer numeric id
        peer: String,
        /// Display name
        name: String,
    },

    /// Remove a contact name
    Remove {
        /// Peer numeric id
        peer: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    // Initialize tracing
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let db_path = config.database_path();
    tracing::debug!(path = %db_path.display(), "Opening storage");
    let mut storage = SecureStorage::open(&db_path)
        .with_context(|| format!("Failed to open storage at {}", db_path.display()))?;

    match cli.command {
        Commands::Init => {
            ensure_no_account(&storage)?;
            let identity = Identity::generate();
            let password = read_new_password()?;
            storage.create(&identity, &password)?;

            println!("Your number: {}", identity.display_form());
            println!();
            println!("Login credential (keep it secret, it is your private key):");
            println!("{}", identity.login_credential());
        }
        Commands::Login { credential } => {
            ensure_no_account(&storage)?;
            let identity = Identity::import(&credential).context("Invalid login credential")?;
            let password = read_new_password()?;
            let identity =
                storage.create_from_import(PendingImport::from_identity(identity), &password)?;
            println!("Logged in as {}", identity.display_form());
        }
        Commands::Whoami => match storage.saved_numeric_id()? {
            Some(id) => println!("{}", id.display_form()),
            None => bail!("No account. Run `hashhello init` or `hashhello login`."),
        },
        Commands::Credential => {
            let identity = unlock(&mut storage)?;
            println!("{}", identity.login_credential());
        }
        Commands::Contacts(command) => {
            unlock(&mut storage)?;
            let mut contacts = storage.load_contacts()?;
            match command {
                ContactsCommands::List => print_contacts(&contacts),
                ContactsCommands::Add { peer, name } => {
                    let peer = parse_peer(&peer)?;
                    contacts.set(peer.clone(), &name);
                    storage.save_contacts(&contacts)?;
                    println!("Saved {} as {}", peer.display_form(), contacts.label(&peer));
                }
                ContactsCommands::Remove { peer } => {
                    let peer = parse_peer(&peer)?;
                    if contacts.remove(&peer).is_none() {
                        bail!("No contact named for {}", peer.display_form());
                    }
                    storage.save_contacts(&contacts)?;
                    println!("Removed {}", peer.display_form());
                }
            }
        }
        Commands::Chats => {
            unlock(&mut storage)?;
            let contacts = storage.load_contacts()?;
            let mut chats: Vec<_> = storage.load_sessions()?.into_values().collect();
            chats.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

            if chats.is_empty() {
                println!("No chats.");
                return Ok(());
            }
            for chat in &chats {
                let unread = if chat.unread > 0 {
                    format!(" ({} unread)", chat.unread)
                } else {
                    String::new()
                };
                println!(
                    "{:<24}{:>10}  {}{}",
                    truncate_str(&contacts.label(&chat.id), 24),
                    format_relative_time(chat.timestamp),
                    truncate_str(&chat.last_message, 40),
                    unread
                );
            }
            println!();
            println!("Total: {} chat(s)", chats.len());
        }
        Commands::History { peer } => {
            let peer = parse_peer(&peer)?;
            unlock(&mut storage)?;
            let contacts = storage.load_contacts()?;
            let sessions = storage.load_sessions()?;
            let Some(chat) = sessions.get(&peer) else {
                bail!("No chat with {}", peer.display_form());
            };
            let label = contacts.label(&peer);
            for message in &chat.messages {
                print_message(message, &label);
            }
        }
        Commands::Export { file } => {
            let identity = unlock(&mut storage)?;
            let bundle = storage.export_backup(&identity)?;
            write_backup(&file, &bundle.to_json()?)?;
            println!("Backup written to {}", file.display());
            eprintln!("Warning: the backup is not encrypted and contains your private key.");
        }
        Commands::Import { file } => {
            ensure_no_account(&storage)?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let pending = BackupBundle::parse(&text)?;
            let password = read_new_password()?;
            let identity = storage.create_from_import(pending, &password)?;
            println!("Imported account {}", identity.display_form());
        }
        Commands::Forget { yes } => {
            if !yes && !confirm("Delete the identity, all chats and contacts?")? {
                println!("Aborted.");
                return Ok(());
            }
            storage.forget()?;
            println!("All local data removed.");
        }
    }

    Ok(())
}

fn ensure_no_account(storage: &SecureStorage) -> anyhow::Result<()> {
    if let Some(id) = storage.saved_numeric_id()? {
        bail!(
            "An account ({}) already exists. Run `hashhello forget` first.",
            id.display_form()
        );
    }
    if storage.has_account()? {
        bail!("An account already exists. Run `hashhello forget` first.");
    }
    Ok(())
}

fn unlock(storage: &mut SecureStorage) -> anyhow::Result<Identity> {
    let prompt = match storage.saved_numeric_id()? {
        Some(id) => format!("Password for {}: ", id.display_form()),
        None => "Password: ".to_string(),
    };
    let password = read_password(&prompt)?;
    match storage.unlock(&password) {
        Ok(identity) => Ok(identity),
        Err(StorageError::WrongPassword) => bail!("Wrong password"),
        Err(StorageError::NoAccount) => {
            bail!("No account. Run `hashhello init` or `hashhello login`.")
        }
        Err(e) => Err(e.into()),
    }
}

fn read_password(prompt: &str) -> anyhow::Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    rpassword::prompt_password(prompt).context("Failed to read password")
}

fn read_new_password() -> anyhow::Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if password.is_empty() {
            bail!("{} is empty", PASSWORD_ENV);
        }
        return Ok(password);
    }

    loop {
        let password =
            rpassword::prompt_password("Choose a master password: ").context("Failed to read password")?;
        if password.is_empty() {
            eprintln!("Password cannot be empty");
            continue;
        }
        let confirm =
            rpassword::prompt_password("Confirm password: ").context("Failed to read password")?;
        if password != confirm {
            eprintln!("Passwords don't match");
            continue;
        }
        return Ok(password);
    }
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    eprint!("{} [y/N] ", question);
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn parse_peer(input: &str) -> anyhow::Result<NumericId> {
    NumericId::parse(input).with_context(|| format!("Invalid numeric id: {}", input))
}

fn write_backup(path: &Path, json: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn print_contacts(contacts: &ContactBook) {
    if contacts.is_empty() {
        println!("No contacts.");
        return;
    }
    for (id, name) in contacts.iter() {
        println!("{}  {}", id.display_form(), name);
    }
}

fn print_message(message: &Message, peer_label: &str) {
    let who = match message.sender {
        Sender::Local => "me",
        Sender::Peer => peer_label,
    };
    println!(
        "[{:>8}] {}: {}",
        format_relative_time(message.timestamp),
        who,
        message.content.preview()
    );
}

/// Format an epoch-millisecond timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: i64) -> String {
    let now = messenger::session::now_millis();
    let elapsed = (now.saturating_sub(timestamp_ms) / 1000).max(0);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if
/// truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_login_command() {
        let cli = Cli::try_parse_from(["hashhello", "login", "eyJwaG9uZSI6In0="]).unwrap();
        match cli.command {
            Commands::Login { credential } => assert_eq!(credential, "eyJwaG9uZSI6In0="),
            _ => panic!("Expected Login command"),
        }
    }

    #[test]
    fn test_contacts_add() {
        let cli =
            Cli::try_parse_from(["hashhello", "contacts", "add", "#123 456 789", "Alice"]).unwrap();
        match cli.command {
            Commands::Contacts(ContactsCommands::Add { peer, name }) => {
                assert_eq!(peer, "#123 456 789");
                assert_eq!(name, "Alice");
            }
            _ => panic!("Expected Contacts Add command"),
        }
    }

    #[test]
    fn test_contacts_without_subcommand_fails() {
        assert!(Cli::try_parse_from(["hashhello", "contacts"]).is_err());
    }

    #[test]
    fn test_history_command() {
        let cli = Cli::try_parse_from(["hashhello", "history", "123456789"]).unwrap();
        assert!(matches!(cli.command, Commands::History { peer } if peer == "123456789"));
    }

    #[test]
    fn test_export_import_paths() {
        let cli = Cli::try_parse_from(["hashhello", "export", "/tmp/backup.json"]).unwrap();
        assert!(
            matches!(cli.command, Commands::Export { file } if file == PathBuf::from("/tmp/backup.json"))
        );

        let cli = Cli::try_parse_from(["hashhello", "import", "backup.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Import { .. }));
    }

    #[test]
    fn test_forget_flags() {
        let cli = Cli::try_parse_from(["hashhello", "forget", "-y"]).unwrap();
        assert!(matches!(cli.command, Commands::Forget { yes: true }));
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["hashhello", "-v", "-c", "/path/to/config.toml", "whoami"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["hashhello"]).is_err());
    }

    #[test]
    fn test_parse_peer() {
        assert_eq!(parse_peer("#123 456 789").unwrap().as_str(), "123456789");
        assert!(parse_peer("12").is_err());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a long message here", 10), "a long ...");
    }

    #[test]
    fn test_format_relative_time() {
        let now = messenger::session::now_millis();
        assert_eq!(format_relative_time(now), "0s ago");
        assert_eq!(format_relative_time(now - 120_000), "2m ago");
        assert_eq!(format_relative_time(now - 7_200_000), "2h ago");
    }
}
