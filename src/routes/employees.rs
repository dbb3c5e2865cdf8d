use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::{prelude::*, result::DatabaseErrorKind, PgConnection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::sites::{ensure_site_exists, site_names};
use crate::access::{Caller, Permission, Role, ScopeDomain, SiteScope};
use crate::auth::password::{hash_password, MIN_PASSWORD_LENGTH};
use crate::error::{AppError, AppResult};
use crate::history::to_iso;
use crate::ledger::money;
use crate::models::{Employee, NewEmployee, NewEmployeeSite, NewUser, NewUserSite};
use crate::schema::{employee_sites, employees, user_sites, users};
use crate::state::AppState;
use crate::utils::json::{nullable, optional_text, required_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Cdi,
    Cdd,
    Benevole,
}

impl ContractType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractType::Cdi => "cdi",
            ContractType::Cdd => "cdd",
            ContractType::Benevole => "benevole",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ContractType::Cdi => "Contrat à durée indéterminée",
            ContractType::Cdd => "Contrat à durée déterminée",
            ContractType::Benevole => "Bénévole",
        }
    }
}

impl FromStr for ContractType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "cdi" => Ok(ContractType::Cdi),
            "cdd" => Ok(ContractType::Cdd),
            "benevole" => Ok(ContractType::Benevole),
            other => Err(format!("unknown contract type '{other}'")),
        }
    }
}

#[derive(Deserialize)]
pub struct EmployeeListQuery {
    pub site: Option<Uuid>,
    #[serde(default)]
    pub include_archived: bool,
}

/// Login created alongside an employee record.
#[derive(Deserialize)]
pub struct AccountRequest {
    pub username: String,
    pub password: String,
    pub role: Role,
    pub email: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateEmployeeRequest {
    pub last_name: String,
    pub first_name: String,
    pub position: String,
    pub contract_type: ContractType,
    pub hire_date: NaiveDate,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    pub salary: Option<Decimal>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub site_ids: Vec<Uuid>,
    pub create_account: Option<AccountRequest>,
}

#[derive(Deserialize)]
pub struct UpdateEmployeeRequest {
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub position: Option<String>,
    pub contract_type: Option<ContractType>,
    pub hire_date: Option<NaiveDate>,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub salary: Option<Option<Decimal>>,
    pub notes: Option<String>,
    pub site_ids: Option<Vec<Uuid>>,
    pub create_account: Option<AccountRequest>,
}

#[derive(AsChangeset)]
#[diesel(table_name = employees, treat_none_as_null = true)]
struct EmployeeChangeset<'a> {
    last_name: &'a str,
    first_name: &'a str,
    position: &'a str,
    contract_type: &'a str,
    hire_date: NaiveDate,
    phone: &'a str,
    address: &'a str,
    salary: Option<Decimal>,
    notes: &'a str,
    updated_at: NaiveDateTime,
}

#[derive(Serialize)]
pub struct EmployeeSite {
    pub id: Uuid,
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct EmployeeResponse {
    pub id: Uuid,
    pub last_name: String,
    pub first_name: String,
    pub position: String,
    pub contract_type: String,
    pub contract_type_label: Option<&'static str>,
    pub hire_date: NaiveDate,
    pub phone: String,
    pub address: String,
    pub salary: Option<Decimal>,
    pub notes: String,
    pub sites: Vec<EmployeeSite>,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

fn field_error(field: &str, message: impl Into<String>) -> AppError {
    AppError::validation(message, json!({ "field": field }))
}

fn check_salary(salary: Option<Decimal>) -> AppResult<Option<Decimal>> {
    match salary {
        Some(value) if value < Decimal::ZERO => Err(field_error("salary", "salary cannot be negative")),
        Some(value) if value.normalize().scale() > 2 => Err(field_error(
            "salary",
            "salary must have at most two decimal places",
        )),
        other => Ok(other.map(money)),
    }
}

/// Sites an employee record will be linked to. An empty request falls back
/// to the caller's default site; every site must lie within the caller's
/// general scope.
fn resolve_sites(
    conn: &mut PgConnection,
    caller: &Caller,
    requested: &[Uuid],
) -> AppResult<Vec<Uuid>> {
    let policy = caller.form_policy(ScopeDomain::General);
    let resolved: BTreeSet<Uuid> = if requested.is_empty() {
        std::iter::once(policy.resolve_site(None)?).collect()
    } else {
        requested
            .iter()
            .map(|site_id| policy.resolve_site(Some(*site_id)))
            .collect::<AppResult<_>>()?
    };
    for site_id in &resolved {
        ensure_site_exists(conn, *site_id)?;
    }
    Ok(resolved.into_iter().collect())
}

/// Checked login fields, ready to insert.
struct AccountDraft {
    username: String,
    password_hash: String,
    role: Role,
    email: Option<String>,
}

fn prepare_account(caller: &Caller, request: AccountRequest) -> AppResult<AccountDraft> {
    let username = required_text("username", &request.username)
        .map_err(|msg| field_error("username", msg))?;
    if request.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(field_error(
            "password",
            format!("password must be at least {MIN_PASSWORD_LENGTH} characters"),
        ));
    }
    if request.role == Role::Directeur
        && !(caller.is_superuser || caller.role == Some(Role::Directeur))
    {
        warn!(user_id = %caller.user_id, "attempt to create a directeur account rejected");
        return Err(AppError::forbidden());
    }
    let email = optional_text(request.email.as_deref());
    if let Some(email) = &email {
        if !email.contains('@') {
            return Err(field_error("email", "email is not valid"));
        }
    }
    Ok(AccountDraft {
        username,
        password_hash: hash_password(&request.password)?,
        role: request.role,
        email,
    })
}

/// Inserts the user and its site assignments. Must run inside the
/// transaction that writes the employee row.
fn insert_account(
    conn: &mut PgConnection,
    draft: AccountDraft,
    first_name: &str,
    last_name: &str,
    site_ids: &[Uuid],
) -> AppResult<Uuid> {
    let new_user = NewUser {
        id: Uuid::new_v4(),
        username: draft.username,
        password_hash: draft.password_hash,
        role: draft.role.as_str().to_string(),
        email: draft.email,
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        is_superuser: false,
        is_central_accountant: false,
    };
    let user_id: Uuid = match diesel::insert_into(users::table)
        .values(&new_user)
        .returning(users::id)
        .get_result(conn)
    {
        Ok(id) => id,
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::conflict("username is already taken"));
        }
        Err(err) => return Err(err.into()),
    };
    let links: Vec<NewUserSite> = site_ids
        .iter()
        .map(|site_id| NewUserSite {
            user_id,
            site_id: *site_id,
        })
        .collect();
    diesel::insert_into(user_sites::table)
        .values(&links)
        .execute(conn)?;
    Ok(user_id)
}

/// Replaces the employee's links within `scope`. Links to sites outside the
/// scope are left untouched.
fn replace_sites(
    conn: &mut PgConnection,
    employee_id: Uuid,
    site_ids: &[Uuid],
    scope: &SiteScope,
) -> QueryResult<()> {
    let mut removal = diesel::delete(employee_sites::table)
        .filter(employee_sites::employee_id.eq(employee_id))
        .into_boxed();
    if let Some(visible) = scope.restriction() {
        removal = removal.filter(employee_sites::site_id.eq_any(visible));
    }
    removal.execute(conn)?;
    let links: Vec<NewEmployeeSite> = site_ids
        .iter()
        .map(|site_id| NewEmployeeSite {
            employee_id,
            site_id: *site_id,
        })
        .collect();
    diesel::insert_into(employee_sites::table)
        .values(&links)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

fn build_responses(
    conn: &mut PgConnection,
    rows: Vec<Employee>,
) -> QueryResult<Vec<EmployeeResponse>> {
    let ids: Vec<Uuid> = rows.iter().map(|employee| employee.id).collect();
    let links: Vec<(Uuid, Uuid)> = employee_sites::table
        .filter(employee_sites::employee_id.eq_any(&ids))
        .select((employee_sites::employee_id, employee_sites::site_id))
        .load(conn)?;
    let site_ids: Vec<Uuid> = links
        .iter()
        .map(|(_, site_id)| *site_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let names = site_names(conn, &site_ids)?;

    let user_ids: Vec<Uuid> = rows.iter().filter_map(|employee| employee.user_id).collect();
    let usernames: HashMap<Uuid, String> = if user_ids.is_empty() {
        HashMap::new()
    } else {
        users::table
            .filter(users::id.eq_any(&user_ids))
            .select((users::id, users::username))
            .load::<(Uuid, String)>(conn)?
            .into_iter()
            .collect()
    };

    let mut sites_by_employee: HashMap<Uuid, Vec<EmployeeSite>> = HashMap::new();
    for (employee_id, site_id) in links {
        sites_by_employee.entry(employee_id).or_default().push(EmployeeSite {
            id: site_id,
            name: names.get(&site_id).cloned(),
        });
    }

    Ok(rows
        .into_iter()
        .map(|employee| EmployeeResponse {
            sites: sites_by_employee.remove(&employee.id).unwrap_or_default(),
            username: employee.user_id.and_then(|id| usernames.get(&id).cloned()),
            contract_type_label: employee
                .contract_type
                .parse::<ContractType>()
                .ok()
                .map(ContractType::label),
            id: employee.id,
            last_name: employee.last_name,
            first_name: employee.first_name,
            position: employee.position,
            contract_type: employee.contract_type,
            hire_date: employee.hire_date,
            phone: employee.phone,
            address: employee.address,
            salary: employee.salary.map(money),
            notes: employee.notes,
            user_id: employee.user_id,
            is_active: employee.is_active,
            created_at: to_iso(employee.created_at),
        })
        .collect())
}

/// An employee is visible when any of its sites lies in the caller's scope.
fn find_employee_in_scope(
    conn: &mut PgConnection,
    caller: &Caller,
    employee_id: Uuid,
) -> AppResult<Employee> {
    let employee: Employee = employees::table.find(employee_id).first(conn)?;
    if let Some(ids) = caller.scope(ScopeDomain::General).restriction() {
        let visible: bool = diesel::select(diesel::dsl::exists(
            employee_sites::table
                .filter(employee_sites::employee_id.eq(employee_id))
                .filter(employee_sites::site_id.eq_any(ids)),
        ))
        .get_result(conn)?;
        if !visible {
            return Err(AppError::not_found());
        }
    }
    Ok(employee)
}

fn respond_one(conn: &mut PgConnection, employee: Employee) -> AppResult<EmployeeResponse> {
    build_responses(conn, vec![employee])?
        .pop()
        .ok_or_else(AppError::not_found)
}

pub async fn list_employees(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<EmployeeListQuery>,
) -> AppResult<Json<Vec<EmployeeResponse>>> {
    caller.require(Permission::ViewEmployee)?;
    let mut conn = state.db()?;
    let mut query = employees::table.into_boxed();
    let scope = caller.scope(ScopeDomain::General);
    if let Some(ids) = scope.narrowed(params.site).restriction() {
        query = query.filter(
            employees::id.eq_any(
                employee_sites::table
                    .filter(employee_sites::site_id.eq_any(ids))
                    .select(employee_sites::employee_id),
            ),
        );
    }
    if !params.include_archived {
        query = query.filter(employees::is_active.eq(true));
    }
    let rows: Vec<Employee> = query
        .order((employees::last_name.asc(), employees::first_name.asc()))
        .load(&mut conn)?;
    Ok(Json(build_responses(&mut conn, rows)?))
}

pub async fn get_employee(
    State(state): State<AppState>,
    caller: Caller,
    Path(employee_id): Path<Uuid>,
) -> AppResult<Json<EmployeeResponse>> {
    caller.require(Permission::ViewEmployee)?;
    let mut conn = state.db()?;
    let employee = find_employee_in_scope(&mut conn, &caller, employee_id)?;
    Ok(Json(respond_one(&mut conn, employee)?))
}

pub async fn create_employee(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateEmployeeRequest>,
) -> AppResult<(StatusCode, Json<EmployeeResponse>)> {
    caller.require(Permission::AddEmployee)?;
    let new_employee = NewEmployee {
        id: Uuid::new_v4(),
        user_id: None,
        last_name: required_text("last_name", &payload.last_name)
            .map_err(|msg| field_error("last_name", msg))?,
        first_name: required_text("first_name", &payload.first_name)
            .map_err(|msg| field_error("first_name", msg))?,
        position: required_text("position", &payload.position)
            .map_err(|msg| field_error("position", msg))?,
        contract_type: payload.contract_type.as_str().to_string(),
        hire_date: payload.hire_date,
        phone: payload.phone.trim().to_string(),
        address: payload.address.trim().to_string(),
        salary: check_salary(payload.salary)?,
        notes: payload.notes.trim().to_string(),
    };
    let account = payload
        .create_account
        .map(|request| prepare_account(&caller, request))
        .transpose()?;

    let mut conn = state.db()?;
    let site_ids = resolve_sites(&mut conn, &caller, &payload.site_ids)?;
    let scope = caller.scope(ScopeDomain::General);

    let employee = conn.transaction::<Employee, AppError, _>(|conn| {
        let mut employee: Employee = diesel::insert_into(employees::table)
            .values(&new_employee)
            .get_result(conn)?;
        replace_sites(conn, employee.id, &site_ids, &scope)?;
        if let Some(draft) = account {
            let user_id = insert_account(
                conn,
                draft,
                &employee.first_name,
                &employee.last_name,
                &site_ids,
            )?;
            employee = diesel::update(employees::table.find(employee.id))
                .set(employees::user_id.eq(Some(user_id)))
                .get_result(conn)?;
        }
        Ok(employee)
    })?;

    info!(
        employee_id = %employee.id,
        with_account = employee.user_id.is_some(),
        created_by = %caller.user_id,
        "employee created"
    );
    Ok((StatusCode::CREATED, Json(respond_one(&mut conn, employee)?)))
}

pub async fn update_employee(
    State(state): State<AppState>,
    caller: Caller,
    Path(employee_id): Path<Uuid>,
    Json(payload): Json<UpdateEmployeeRequest>,
) -> AppResult<Json<EmployeeResponse>> {
    caller.require(Permission::ChangeEmployee)?;
    let mut conn = state.db()?;
    let existing = find_employee_in_scope(&mut conn, &caller, employee_id)?;
    if !existing.is_active {
        return Err(AppError::bad_request("archived employees cannot be modified"));
    }

    let text = |field: &str, value: Option<String>, current: String| -> AppResult<String> {
        match value {
            Some(value) => required_text(field, &value).map_err(|msg| field_error(field, msg)),
            None => Ok(current),
        }
    };
    let last_name = text("last_name", payload.last_name, existing.last_name)?;
    let first_name = text("first_name", payload.first_name, existing.first_name)?;
    let position = text("position", payload.position, existing.position)?;
    let contract_type = payload
        .contract_type
        .map(|contract| contract.as_str().to_string())
        .unwrap_or(existing.contract_type);
    let phone = payload
        .phone
        .map(|value| value.trim().to_string())
        .unwrap_or(existing.phone);
    let address = payload
        .address
        .map(|value| value.trim().to_string())
        .unwrap_or(existing.address);
    let notes = payload
        .notes
        .map(|value| value.trim().to_string())
        .unwrap_or(existing.notes);
    let salary = match payload.salary {
        Some(salary) => check_salary(salary)?,
        None => existing.salary,
    };

    let site_ids = match payload.site_ids.as_deref() {
        Some(requested) => Some(resolve_sites(&mut conn, &caller, requested)?),
        None => None,
    };
    let account = match payload.create_account {
        Some(_) if existing.user_id.is_some() => {
            return Err(AppError::conflict("this employee already has an account"));
        }
        Some(request) => Some(prepare_account(&caller, request)?),
        None => None,
    };

    let changes = EmployeeChangeset {
        last_name: &last_name,
        first_name: &first_name,
        position: &position,
        contract_type: &contract_type,
        hire_date: payload.hire_date.unwrap_or(existing.hire_date),
        phone: &phone,
        address: &address,
        salary,
        notes: &notes,
        updated_at: Utc::now().naive_utc(),
    };

    let employee = conn.transaction::<Employee, AppError, _>(|conn| {
        let mut employee: Employee = diesel::update(employees::table.find(employee_id))
            .set(&changes)
            .get_result(conn)?;
        if let Some(site_ids) = &site_ids {
            replace_sites(conn, employee_id, site_ids, &caller.scope(ScopeDomain::General))?;
        }
        if let Some(draft) = account {
            let account_sites: Vec<Uuid> = employee_sites::table
                .filter(employee_sites::employee_id.eq(employee_id))
                .select(employee_sites::site_id)
                .load(conn)?;
            let user_id = insert_account(conn, draft, &first_name, &last_name, &account_sites)?;
            employee = diesel::update(employees::table.find(employee_id))
                .set(employees::user_id.eq(Some(user_id)))
                .get_result(conn)?;
        }
        Ok(employee)
    })?;

    info!(employee_id = %employee.id, updated_by = %caller.user_id, "employee updated");
    Ok(Json(respond_one(&mut conn, employee)?))
}

pub async fn archive_employee(
    State(state): State<AppState>,
    caller: Caller,
    Path(employee_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    caller.require(Permission::ArchiveEmployee)?;
    let mut conn = state.db()?;
    find_employee_in_scope(&mut conn, &caller, employee_id)?;
    diesel::update(employees::table.find(employee_id))
        .set((
            employees::is_active.eq(false),
            employees::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
    info!(employee_id = %employee_id, archived_by = %caller.user_id, "employee archived");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(role: Role) -> Caller {
        Caller {
            user_id: Uuid::new_v4(),
            username: "rh".into(),
            role: Some(role),
            is_superuser: false,
            is_central_accountant: false,
            site_ids: BTreeSet::new(),
        }
    }

    fn request(role: Role) -> AccountRequest {
        AccountRequest {
            username: " a.diallo ".into(),
            password: "long-enough".into(),
            role,
            email: Some("a.diallo@example.org".into()),
        }
    }

    #[test]
    fn only_directeurs_create_directeur_accounts() {
        let err = prepare_account(&caller(Role::Rh), request(Role::Directeur))
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(prepare_account(&caller(Role::Directeur), request(Role::Directeur)).is_ok());
    }

    #[test]
    fn account_fields_are_checked() {
        let draft = prepare_account(&caller(Role::Rh), request(Role::Secretaire)).unwrap();
        assert_eq!(draft.username, "a.diallo");

        let mut short = request(Role::Secretaire);
        short.password = "short".into();
        assert!(prepare_account(&caller(Role::Rh), short).is_err());
    }

    #[test]
    fn salary_must_be_positive_cents() {
        assert!(check_salary(Some("-1".parse().unwrap())).is_err());
        assert!(check_salary(Some("10.555".parse().unwrap())).is_err());
        assert_eq!(
            check_salary(Some("1500".parse().unwrap())).unwrap().unwrap().to_string(),
            "1500.00"
        );
        assert_eq!(check_salary(None).unwrap(), None);
    }

    #[test]
    fn contract_types_parse() {
        assert_eq!("CDD".parse::<ContractType>().unwrap(), ContractType::Cdd);
        assert!("stage".parse::<ContractType>().is_err());
    }
}
