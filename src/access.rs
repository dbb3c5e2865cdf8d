//! Who may do what, and on which sites.
//!
//! Every scoped handler goes through [`Caller::scope`]; nothing else decides
//! whether a row is visible. Rows outside the scope behave as if they did not
//! exist, so lookups of out-of-scope identifiers answer 404.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::User;
use crate::schema::{user_sites, users};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Directeur,
    Comptable,
    Soignant,
    Gestionnaire,
    Benevole,
    Secretaire,
    Rh,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Directeur,
        Role::Comptable,
        Role::Soignant,
        Role::Gestionnaire,
        Role::Benevole,
        Role::Secretaire,
        Role::Rh,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Directeur => "directeur",
            Role::Comptable => "comptable",
            Role::Soignant => "soignant",
            Role::Gestionnaire => "gestionnaire",
            Role::Benevole => "benevole",
            Role::Secretaire => "secretaire",
            Role::Rh => "rh",
        }
    }

    /// Roles that see every site when the bearer has no explicit assignment.
    pub fn is_global(self) -> bool {
        matches!(self, Role::Directeur | Role::Gestionnaire | Role::Rh)
    }

    pub fn permissions(self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Directeur => &Permission::ALL,
            Role::Comptable => &[
                ViewAccount,
                ManageAccount,
                ViewTransaction,
                AddTransaction,
                ChangeTransaction,
                ArchiveTransaction,
                ViewSponsorship,
                ManageSponsorship,
                ViewReport,
            ],
            Role::Soignant => &[
                ViewChild,
                ChangeChild,
                ViewMedical,
                AddMedical,
                ChangeMedical,
                ViewSchool,
                AddSchool,
                ChangeSchool,
            ],
            Role::Gestionnaire => &[
                ViewChild,
                AddChild,
                ChangeChild,
                ArchiveChild,
                ViewDocument,
                AddDocument,
                DeleteDocument,
                ViewMedical,
                AddMedical,
                ChangeMedical,
                ArchiveMedical,
                ViewSchool,
                AddSchool,
                ChangeSchool,
                ArchiveSchool,
                ViewTransaction,
                AddTransaction,
                ChangeTransaction,
            ],
            Role::Benevole => &[ViewChild, ViewTransaction],
            Role::Secretaire => &[
                ViewChild,
                AddChild,
                ChangeChild,
                ViewDocument,
                AddDocument,
                ViewTransaction,
                AddTransaction,
            ],
            Role::Rh => &[ViewEmployee, AddEmployee, ChangeEmployee, ArchiveEmployee],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        Role::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown role '{value}'. Allowed roles: {}",
                    Role::ALL.map(Role::as_str).join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewChild,
    AddChild,
    ChangeChild,
    ArchiveChild,
    ViewDocument,
    AddDocument,
    DeleteDocument,
    ViewMedical,
    AddMedical,
    ChangeMedical,
    ArchiveMedical,
    ViewSchool,
    AddSchool,
    ChangeSchool,
    ArchiveSchool,
    ViewAccount,
    ManageAccount,
    ViewTransaction,
    AddTransaction,
    ChangeTransaction,
    ArchiveTransaction,
    ViewSponsorship,
    ManageSponsorship,
    ViewReport,
    ViewEmployee,
    AddEmployee,
    ChangeEmployee,
    ArchiveEmployee,
}

impl Permission {
    pub const ALL: [Permission; 28] = [
        Permission::ViewChild,
        Permission::AddChild,
        Permission::ChangeChild,
        Permission::ArchiveChild,
        Permission::ViewDocument,
        Permission::AddDocument,
        Permission::DeleteDocument,
        Permission::ViewMedical,
        Permission::AddMedical,
        Permission::ChangeMedical,
        Permission::ArchiveMedical,
        Permission::ViewSchool,
        Permission::AddSchool,
        Permission::ChangeSchool,
        Permission::ArchiveSchool,
        Permission::ViewAccount,
        Permission::ManageAccount,
        Permission::ViewTransaction,
        Permission::AddTransaction,
        Permission::ChangeTransaction,
        Permission::ArchiveTransaction,
        Permission::ViewSponsorship,
        Permission::ManageSponsorship,
        Permission::ViewReport,
        Permission::ViewEmployee,
        Permission::AddEmployee,
        Permission::ChangeEmployee,
        Permission::ArchiveEmployee,
    ];
}

/// Which family of data a query touches. The central-accountant flag only
/// widens financial queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDomain {
    General,
    Financial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteScope {
    Unrestricted,
    Sites(BTreeSet<Uuid>),
}

impl SiteScope {
    pub fn permits(&self, site_id: Uuid) -> bool {
        match self {
            SiteScope::Unrestricted => true,
            SiteScope::Sites(ids) => ids.contains(&site_id),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, SiteScope::Unrestricted)
    }

    /// Site ids to filter on, or `None` when no filter applies.
    pub fn restriction(&self) -> Option<Vec<Uuid>> {
        match self {
            SiteScope::Unrestricted => None,
            SiteScope::Sites(ids) => Some(ids.iter().copied().collect()),
        }
    }

    /// Intersects the scope with an optional site filter from the request.
    /// A filter outside the scope yields an empty scope, never an error.
    pub fn narrowed(&self, requested: Option<Uuid>) -> SiteScope {
        match requested {
            None => self.clone(),
            Some(site_id) if self.permits(site_id) => SiteScope::Sites(BTreeSet::from([site_id])),
            Some(_) => SiteScope::Sites(BTreeSet::new()),
        }
    }
}

/// The authenticated user with everything the resolver needs, reloaded from
/// the database on every request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub username: String,
    pub role: Option<Role>,
    pub is_superuser: bool,
    pub is_central_accountant: bool,
    pub site_ids: BTreeSet<Uuid>,
}

impl Caller {
    pub fn load(conn: &mut PgConnection, user_id: Uuid) -> AppResult<Self> {
        let user: User = users::table
            .find(user_id)
            .first(conn)
            .optional()?
            .ok_or_else(AppError::unauthorized)?;

        let site_ids: Vec<Uuid> = user_sites::table
            .filter(user_sites::user_id.eq(user_id))
            .select(user_sites::site_id)
            .load(conn)?;

        let role = match user.role.parse::<Role>() {
            Ok(role) => Some(role),
            Err(_) if user.is_superuser => None,
            Err(err) => {
                warn!(user_id = %user.id, role = %user.role, error = %err, "user carries an unknown role");
                None
            }
        };

        Ok(Self {
            user_id: user.id,
            username: user.username,
            role,
            is_superuser: user.is_superuser,
            is_central_accountant: user.is_central_accountant,
            site_ids: site_ids.into_iter().collect(),
        })
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.is_superuser
            || self
                .role
                .map(|role| role.permissions().contains(&permission))
                .unwrap_or(false)
    }

    pub fn require(&self, permission: Permission) -> AppResult<()> {
        if self.has(permission) {
            Ok(())
        } else {
            warn!(
                user_id = %self.user_id,
                permission = ?permission,
                "permission check rejected request"
            );
            Err(AppError::forbidden())
        }
    }

    pub fn permissions(&self) -> Vec<Permission> {
        Permission::ALL
            .iter()
            .copied()
            .filter(|permission| self.has(*permission))
            .collect()
    }

    /// Resolution order: superuser, global role without assignments,
    /// central accountant (financial only), then the explicit site set.
    pub fn scope(&self, domain: ScopeDomain) -> SiteScope {
        if self.is_superuser {
            return SiteScope::Unrestricted;
        }
        if self.site_ids.is_empty() && self.role.map(Role::is_global).unwrap_or(false) {
            return SiteScope::Unrestricted;
        }
        if domain == ScopeDomain::Financial && self.is_central_accountant {
            return SiteScope::Unrestricted;
        }
        SiteScope::Sites(self.site_ids.clone())
    }

    pub fn form_policy(&self, domain: ScopeDomain) -> FormPolicy {
        FormPolicy::for_caller(self, domain)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;
        let mut conn = state.db()?;
        Caller::load(&mut conn, user.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    Hidden,
    Optional,
    Required,
}

/// Which site field a create form shows to this caller and what it falls
/// back to. Built once per request from the caller's scope.
#[derive(Debug, Clone, Serialize)]
pub struct FormPolicy {
    pub site_field: FieldRule,
    pub default_site: Option<Uuid>,
    #[serde(skip)]
    allowed: SiteScope,
}

impl FormPolicy {
    pub fn for_caller(caller: &Caller, domain: ScopeDomain) -> Self {
        let allowed = caller.scope(domain);
        match &allowed {
            SiteScope::Unrestricted => Self {
                site_field: FieldRule::Required,
                default_site: None,
                allowed,
            },
            SiteScope::Sites(ids) if ids.len() == 1 => Self {
                site_field: FieldRule::Hidden,
                default_site: ids.iter().next().copied(),
                allowed,
            },
            SiteScope::Sites(ids) if ids.is_empty() => Self {
                site_field: FieldRule::Hidden,
                default_site: None,
                allowed,
            },
            SiteScope::Sites(_) => Self {
                site_field: FieldRule::Required,
                default_site: None,
                allowed,
            },
        }
    }

    pub fn resolve_site(&self, requested: Option<Uuid>) -> AppResult<Uuid> {
        match requested {
            Some(site_id) if self.allowed.permits(site_id) => Ok(site_id),
            Some(_) => Err(AppError::forbidden()),
            None => match (self.default_site, self.site_field) {
                (Some(site_id), _) => Ok(site_id),
                (None, FieldRule::Hidden) => Err(AppError::forbidden()),
                (None, _) => Err(AppError::bad_request("site_id is required")),
            },
        }
    }
}
