//! Bootstrap commands for operators: migrations, sites and user accounts.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use diesel::{prelude::*, PgConnection};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use orphanage::{
    access::Role,
    auth::password::{hash_password, MIN_PASSWORD_LENGTH},
    config::{database_url_from_env, redact_database_url},
    db,
    models::{NewSite, NewUser, NewUserSite},
    schema::{sites, user_sites, users},
};

/// Administration tool for the orphanage backend
#[derive(Parser, Debug)]
#[command(name = "manage", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Register a new site
    CreateSite {
        #[arg(long)]
        name: String,
        #[arg(long)]
        city: String,
        #[arg(long)]
        country: String,
        #[arg(long, default_value = "")]
        address: String,
    },

    /// Create a user account
    CreateUser {
        #[arg(long)]
        username: String,
        /// Read from MANAGE_PASSWORD when omitted
        #[arg(long, env = "MANAGE_PASSWORD", hide_env_values = true)]
        password: String,
        /// One of directeur, comptable, soignant, gestionnaire, benevole, secretaire, rh
        #[arg(long, default_value = "benevole")]
        role: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        superuser: bool,
        #[arg(long)]
        central_accountant: bool,
        /// Site names to assign, repeatable
        #[arg(long = "site")]
        sites: Vec<String>,
    },

    /// Assign an existing user to a site
    AssignSite {
        #[arg(long)]
        username: String,
        #[arg(long)]
        site: String,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let (database_url, pool_size) = database_url_from_env()?;
    tracing::info!(
        component = "manage",
        database_url = %redact_database_url(&database_url),
        "connecting to database"
    );
    let pool = db::init_pool_with_size(&database_url, pool_size)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    match cli.command {
        Command::Migrate => {
            let applied = db::run_migrations(&mut conn)?;
            println!("Applied {applied} migration(s).");
        }
        Command::CreateSite {
            name,
            city,
            country,
            address,
        } => {
            let site = NewSite {
                id: Uuid::new_v4(),
                name: name.trim().to_string(),
                city: city.trim().to_string(),
                country: country.trim().to_string(),
                address: address.trim().to_string(),
            };
            diesel::insert_into(sites::table)
                .values(&site)
                .execute(&mut conn)
                .with_context(|| format!("failed to create site '{}'", site.name))?;
            println!("Created site {} ({})", site.name, site.id);
        }
        Command::CreateUser {
            username,
            password,
            role,
            first_name,
            last_name,
            email,
            superuser,
            central_accountant,
            sites,
        } => {
            let role: Role = role.parse().map_err(anyhow::Error::msg)?;
            if password.chars().count() < MIN_PASSWORD_LENGTH {
                bail!("password must be at least {MIN_PASSWORD_LENGTH} characters");
            }
            let site_ids = site_ids_by_name(&mut conn, &sites)?;
            let user = NewUser {
                id: Uuid::new_v4(),
                username: username.trim().to_string(),
                password_hash: hash_password(&password)?,
                role: role.as_str().to_string(),
                email,
                first_name,
                last_name,
                is_superuser: superuser,
                is_central_accountant: central_accountant,
            };

            conn.transaction::<_, anyhow::Error, _>(|conn| {
                diesel::insert_into(users::table)
                    .values(&user)
                    .execute(conn)
                    .with_context(|| format!("failed to create user '{}'", user.username))?;
                let links: Vec<NewUserSite> = site_ids
                    .iter()
                    .map(|site_id| NewUserSite {
                        user_id: user.id,
                        site_id: *site_id,
                    })
                    .collect();
                if !links.is_empty() {
                    diesel::insert_into(user_sites::table)
                        .values(&links)
                        .execute(conn)?;
                }
                Ok(())
            })?;
            println!(
                "Created user {} ({}) with role {} on {} site(s)",
                user.username,
                user.id,
                role,
                site_ids.len()
            );
        }
        Command::AssignSite { username, site } => {
            let user_id: Uuid = users::table
                .filter(users::username.eq(username.trim()))
                .select(users::id)
                .first(&mut conn)
                .optional()?
                .with_context(|| format!("no user named '{username}'"))?;
            let site_id = site_ids_by_name(&mut conn, std::slice::from_ref(&site))?
                .into_iter()
                .next()
                .with_context(|| format!("no site named '{site}'"))?;
            diesel::insert_into(user_sites::table)
                .values(NewUserSite { user_id, site_id })
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            println!("Assigned {username} to {site}");
        }
    }

    Ok(())
}

fn site_ids_by_name(conn: &mut PgConnection, names: &[String]) -> Result<Vec<Uuid>> {
    names
        .iter()
        .map(|name| {
            sites::table
                .filter(sites::name.eq(name.trim()))
                .select(sites::id)
                .first::<Uuid>(conn)
                .optional()?
                .with_context(|| format!("no site named '{name}'"))
        })
        .collect()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
