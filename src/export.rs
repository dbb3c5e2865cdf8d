//! Flattened row sets for spreadsheet downloads.
//!
//! Preview and download both render the rows built here from the same
//! scoped query, so what is shown is what is downloaded.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::{Format, Workbook};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::{money, Direction};
use crate::models::{Child, MedicalFollowup, SchoolFollowup, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Xlsx,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::Csv => "text/csv; charset=utf-8",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Money(Decimal),
    Empty,
}

impl Cell {
    fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    fn date(value: Option<NaiveDate>) -> Self {
        value
            .map(|date| Cell::Text(date.format("%Y-%m-%d").to_string()))
            .unwrap_or(Cell::Empty)
    }

    fn as_csv(&self) -> String {
        match self {
            Cell::Text(value) => value.clone(),
            Cell::Money(value) => money(*value).to_string(),
            Cell::Empty => String::new(),
        }
    }
}

pub trait ExportRow {
    const HEADERS: &'static [&'static str];

    fn cells(&self) -> Vec<Cell>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildExportRow {
    pub id: Uuid,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub sex: String,
    pub birth_place: String,
    pub arrival_date: NaiveDate,
    pub status: String,
    pub departure_date: Option<NaiveDate>,
    pub is_active: bool,
    pub site_name: String,
    pub last_medical_date: Option<NaiveDate>,
    pub last_medical_diagnosis: Option<String>,
    pub last_school_year: Option<String>,
    pub last_school_grade: Option<String>,
}

impl ChildExportRow {
    pub fn project(
        child: Child,
        site_name: &str,
        last_medical: Option<&MedicalFollowup>,
        last_school: Option<&SchoolFollowup>,
    ) -> Self {
        Self {
            id: child.id,
            last_name: child.last_name,
            first_name: child.first_name,
            birth_date: child.birth_date,
            sex: child.sex,
            birth_place: child.birth_place,
            arrival_date: child.arrival_date,
            status: child.status,
            departure_date: child.departure_date,
            is_active: child.is_active,
            site_name: site_name.to_string(),
            last_medical_date: last_medical.map(|followup| followup.consultation_date),
            last_medical_diagnosis: last_medical.map(|followup| followup.diagnosis.clone()),
            last_school_year: last_school.map(|followup| followup.school_year.clone()),
            last_school_grade: last_school.map(|followup| followup.grade.clone()),
        }
    }
}

impl ExportRow for ChildExportRow {
    const HEADERS: &'static [&'static str] = &[
        "ID",
        "Nom",
        "Prénom",
        "Date de naissance",
        "Sexe",
        "Lieu de naissance",
        "Date d'arrivée",
        "Statut",
        "Date de départ",
        "Actif",
        "Site",
        "Dernière consultation",
        "Dernier diagnostic",
        "Dernière année scolaire",
        "Dernière classe",
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id.to_string()),
            Cell::text(&self.last_name),
            Cell::text(&self.first_name),
            Cell::date(Some(self.birth_date)),
            Cell::text(&self.sex),
            Cell::text(&self.birth_place),
            Cell::date(Some(self.arrival_date)),
            Cell::text(&self.status),
            Cell::date(self.departure_date),
            Cell::text(if self.is_active { "oui" } else { "non" }),
            Cell::text(&self.site_name),
            Cell::date(self.last_medical_date),
            self.last_medical_diagnosis
                .as_deref()
                .map(Cell::text)
                .unwrap_or(Cell::Empty),
            self.last_school_year
                .as_deref()
                .map(Cell::text)
                .unwrap_or(Cell::Empty),
            self.last_school_grade
                .as_deref()
                .map(Cell::text)
                .unwrap_or(Cell::Empty),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionExportRow {
    pub id: Uuid,
    pub transaction_date: NaiveDate,
    pub direction: String,
    pub category: String,
    pub account_name: String,
    pub site_name: String,
    pub description: String,
    /// Negative for a sortie.
    pub signed_amount: Decimal,
}

impl TransactionExportRow {
    pub fn project(transaction: Transaction, account_name: &str, site_name: &str) -> Self {
        let signed_amount = match transaction.direction.parse::<Direction>() {
            Ok(direction) => direction.signed(transaction.amount),
            Err(_) => transaction.amount,
        };
        let direction = transaction
            .direction
            .parse::<Direction>()
            .map(|direction| direction.label().to_string())
            .unwrap_or(transaction.direction);

        Self {
            id: transaction.id,
            transaction_date: transaction.transaction_date,
            direction,
            category: transaction.category,
            account_name: account_name.to_string(),
            site_name: site_name.to_string(),
            description: transaction.description,
            signed_amount: money(signed_amount),
        }
    }
}

impl ExportRow for TransactionExportRow {
    const HEADERS: &'static [&'static str] = &[
        "ID",
        "Date",
        "Type",
        "Catégorie",
        "Compte",
        "Site",
        "Description",
        "Montant",
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id.to_string()),
            Cell::date(Some(self.transaction_date)),
            Cell::text(&self.direction),
            Cell::text(&self.category),
            Cell::text(&self.account_name),
            Cell::text(&self.site_name),
            Cell::text(&self.description),
            Cell::Money(self.signed_amount),
        ]
    }
}

pub fn render<R: ExportRow>(format: ExportFormat, sheet_name: &str, rows: &[R]) -> AppResult<Vec<u8>> {
    match format {
        ExportFormat::Csv => render_csv(rows),
        ExportFormat::Xlsx => render_xlsx(sheet_name, rows),
    }
}

fn render_csv<R: ExportRow>(rows: &[R]) -> AppResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(R::HEADERS)?;
    for row in rows {
        writer.write_record(row.cells().iter().map(Cell::as_csv))?;
    }
    writer
        .into_inner()
        .map_err(|err| AppError::internal(format!("csv export failed: {err}")))
}

fn render_xlsx<R: ExportRow>(sheet_name: &str, rows: &[R]) -> AppResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let money_format = Format::new().set_num_format("#,##0.00");

    {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet_name)?;
        for (col, header) in R::HEADERS.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, *header, &header_format)?;
        }

        for (index, row) in rows.iter().enumerate() {
            let row_number = index as u32 + 1;
            for (col, cell) in row.cells().into_iter().enumerate() {
                let col = col as u16;
                match cell {
                    Cell::Text(value) => {
                        worksheet.write_string(row_number, col, value)?;
                    }
                    Cell::Money(value) => {
                        let number = money(value).to_f64().ok_or_else(|| {
                            AppError::internal(format!("amount {value} cannot be written"))
                        })?;
                        worksheet.write_number_with_format(row_number, col, number, &money_format)?;
                    }
                    Cell::Empty => {}
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

/// Download response with an attachment disposition.
pub fn attachment(format: ExportFormat, stem: &str, bytes: Vec<u8>) -> Response {
    let filename = format!("{stem}.{}", format.extension());
    let encoded =
        percent_encoding::utf8_percent_encode(&filename, percent_encoding::NON_ALPHANUMERIC);
    let disposition = format!("attachment; filename=\"{filename}\"; filename*=UTF-8''{encoded}");

    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transaction(direction: &str, amount: &str) -> Transaction {
        let now = Utc::now().naive_utc();
        Transaction {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            direction: direction.into(),
            category: "alimentation".into(),
            amount: amount.parse().unwrap(),
            transaction_date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            description: "Marché, riz et huile".into(),
            sponsorship_id: None,
            created_by: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn exits_are_negated_in_the_signed_column() {
        let row = TransactionExportRow::project(transaction("sortie", "120.5"), "Caisse", "Lomé");
        assert_eq!(row.signed_amount.to_string(), "-120.50");
        assert_eq!(row.direction, "Sortie");

        let row = TransactionExportRow::project(transaction("entree", "80"), "Caisse", "Lomé");
        assert_eq!(row.signed_amount.to_string(), "80.00");
    }

    #[test]
    fn csv_has_header_and_quoted_fields() {
        let rows = vec![TransactionExportRow::project(
            transaction("sortie", "10"),
            "Caisse",
            "Lomé",
        )];
        let bytes = render(ExportFormat::Csv, "Transactions", &rows).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "ID,Date,Type,Catégorie,Compte,Site,Description,Montant"
        );
        let line = lines.next().unwrap();
        assert!(line.contains("\"Marché, riz et huile\""));
        assert!(line.ends_with(",-10.00"));
    }

    #[test]
    fn xlsx_output_is_a_zip_container() {
        let rows = vec![TransactionExportRow::project(
            transaction("entree", "10"),
            "Caisse",
            "Lomé",
        )];
        let bytes = render(ExportFormat::Xlsx, "Transactions", &rows).unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn attachment_sets_disposition() {
        let response = attachment(ExportFormat::Csv, "enfants", b"a,b\n".to_vec());
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.starts_with("attachment; filename=\"enfants.csv\""));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/csv; charset=utf-8"
        );
    }
}
