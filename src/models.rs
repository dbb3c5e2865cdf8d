use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = sites)]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub country: String,
    pub address: String,
    pub created_on: NaiveDate,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sites)]
pub struct NewSite {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub country: String,
    pub address: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub is_superuser: bool,
    pub is_central_accountant: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub is_superuser: bool,
    pub is_central_accountant: bool,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = user_sites)]
pub struct NewUserSite {
    pub user_id: Uuid,
    pub site_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = children)]
#[diesel(belongs_to(Site))]
pub struct Child {
    pub id: Uuid,
    pub site_id: Uuid,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub sex: String,
    pub birth_place: String,
    pub photo_key: Option<String>,
    pub arrival_date: NaiveDate,
    pub admission_reason: String,
    pub life_story: String,
    pub status: String,
    pub departure_date: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = children)]
pub struct NewChild {
    pub id: Uuid,
    pub site_id: Uuid,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub sex: String,
    pub birth_place: String,
    pub photo_key: Option<String>,
    pub arrival_date: NaiveDate,
    pub admission_reason: String,
    pub life_story: String,
    pub status: String,
    pub departure_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = child_history)]
#[diesel(belongs_to(Child))]
pub struct ChildHistoryEntry {
    pub id: Uuid,
    pub child_id: Uuid,
    pub change_kind: String,
    pub snapshot: serde_json::Value,
    pub changed_by: Option<Uuid>,
    pub changed_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = child_history)]
pub struct NewChildHistoryEntry {
    pub id: Uuid,
    pub child_id: Uuid,
    pub change_kind: String,
    pub snapshot: serde_json::Value,
    pub changed_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = child_documents)]
#[diesel(belongs_to(Child))]
pub struct ChildDocument {
    pub id: Uuid,
    pub child_id: Uuid,
    pub document_type: String,
    pub description: Option<String>,
    pub storage_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub uploaded_by: Option<Uuid>,
    pub uploaded_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = child_documents)]
pub struct NewChildDocument {
    pub id: Uuid,
    pub child_id: Uuid,
    pub document_type: String,
    pub description: Option<String>,
    pub storage_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub uploaded_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = medical_followups)]
#[diesel(belongs_to(Child))]
pub struct MedicalFollowup {
    pub id: Uuid,
    pub child_id: Uuid,
    pub consultation_date: NaiveDate,
    pub consultation_type: String,
    pub doctor: String,
    pub diagnosis: String,
    pub treatment: String,
    pub notes: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = medical_followups)]
pub struct NewMedicalFollowup {
    pub id: Uuid,
    pub child_id: Uuid,
    pub consultation_date: NaiveDate,
    pub consultation_type: String,
    pub doctor: String,
    pub diagnosis: String,
    pub treatment: String,
    pub notes: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = school_followups)]
#[diesel(belongs_to(Child))]
pub struct SchoolFollowup {
    pub id: Uuid,
    pub child_id: Uuid,
    pub school_year: String,
    pub school: String,
    pub grade: String,
    pub results: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = school_followups)]
pub struct NewSchoolFollowup {
    pub id: Uuid,
    pub child_id: Uuid,
    pub school_year: String,
    pub school: String,
    pub grade: String,
    pub results: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = accounts)]
#[diesel(belongs_to(Site))]
pub struct Account {
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    pub initial_balance: Decimal,
    pub description: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = accounts)]
pub struct NewAccount {
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    pub initial_balance: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sponsorships)]
#[diesel(belongs_to(Child))]
pub struct Sponsorship {
    pub id: Uuid,
    pub child_id: Uuid,
    pub sponsor_name: String,
    pub monthly_amount: Decimal,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sponsorships)]
pub struct NewSponsorship {
    pub id: Uuid,
    pub child_id: Uuid,
    pub sponsor_name: String,
    pub monthly_amount: Decimal,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = transactions)]
#[diesel(belongs_to(Account))]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: String,
    pub category: String,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub sponsorship_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: String,
    pub category: String,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub sponsorship_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = employees)]
pub struct Employee {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub last_name: String,
    pub first_name: String,
    pub position: String,
    pub contract_type: String,
    pub hire_date: NaiveDate,
    pub phone: String,
    pub address: String,
    pub salary: Option<Decimal>,
    pub notes: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = employees)]
pub struct NewEmployee {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub last_name: String,
    pub first_name: String,
    pub position: String,
    pub contract_type: String,
    pub hire_date: NaiveDate,
    pub phone: String,
    pub address: String,
    pub salary: Option<Decimal>,
    pub notes: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = employee_sites)]
pub struct NewEmployeeSite {
    pub employee_id: Uuid,
    pub site_id: Uuid,
}
