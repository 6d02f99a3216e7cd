//! Finding and opening the patient that was just registered remotely.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use super::strategies;
use crate::errors::AutomationError;
use crate::locator::Locator;
use crate::record::PatientRecord;
use crate::surface::{ElementHandle, RemoteElements};
use crate::wait::{poll_until, PollSpec};

/// Minimum fraction of populated patient fields a row must contain.
pub const MATCH_THRESHOLD: f64 = 0.5;
/// Rows inspected per row selector.
pub const MAX_ROWS_SCORED: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ExactSearch,
    NameSearch,
    FirstRow,
    Scored,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectionMethod::ExactSearch => "chart number search",
            DetectionMethod::NameSearch => "name search",
            DetectionMethod::FirstRow => "newest list entry",
            DetectionMethod::Scored => "field matching",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub method: DetectionMethod,
    pub row_text: String,
}

/// Fraction of the patient's populated identifying fields found in `text`.
/// Zero when the record has no populated fields.
pub fn match_score(record: &PatientRecord, text: &str) -> f64 {
    let checks: Vec<&str> = [
        Some(record.chart_no.as_str()),
        Some(record.name.as_str()),
        record.first_name.as_deref(),
        record.last_name.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .filter(|value| !value.is_empty())
    .collect();

    if checks.is_empty() {
        return 0.0;
    }
    let matched = checks.iter().filter(|value| text.contains(*value)).count();
    matched as f64 / checks.len() as f64
}

/// Locates the newly created patient in the remote list and opens it.
pub struct PatientDetector<'a> {
    elements: &'a RemoteElements<'a>,
    locator: &'a Locator,
    list_url: String,
    wait: PollSpec,
}

impl<'a> PatientDetector<'a> {
    pub fn new(
        elements: &'a RemoteElements<'a>,
        locator: &'a Locator,
        list_url: &str,
        wait: PollSpec,
    ) -> Self {
        Self {
            elements,
            locator,
            list_url: list_url.to_string(),
            wait,
        }
    }

    /// Try, in order: exact chart-number search, name search, the first row
    /// of a refreshed list (if it mentions the patient), then scoring.
    pub fn select(&self, record: &PatientRecord) -> Result<Detection, AutomationError> {
        self.open_list()?;

        if let Some(row) = self.search(&record.chart_no, &record.chart_no)? {
            return self.open(row, DetectionMethod::ExactSearch);
        }
        if let Some(row) = self.search(&record.name, &record.name)? {
            return self.open(row, DetectionMethod::NameSearch);
        }

        self.open_list()?;
        if let Some(row) = self.first_row(record)? {
            return self.open(row, DetectionMethod::FirstRow);
        }
        if let Some(row) = self.best_scored(record)? {
            return self.open(row, DetectionMethod::Scored);
        }

        Err(AutomationError::LocatorNotFound {
            target: format!("patient '{}' ({})", record.name, record.chart_no),
            attempts: [
                DetectionMethod::ExactSearch,
                DetectionMethod::NameSearch,
                DetectionMethod::FirstRow,
                DetectionMethod::Scored,
            ]
            .iter()
            .map(|m| format!("{m}: no matching row"))
            .collect(),
        })
    }

    fn open_list(&self) -> Result<(), AutomationError> {
        let surface = self.elements.surface();
        surface.navigate(&self.list_url)?;
        surface.refresh()?;
        Ok(())
    }

    /// Type `keyword` into the list search box and wait for a row containing `expect`.
    fn search(
        &self,
        keyword: &str,
        expect: &str,
    ) -> Result<Option<(ElementHandle, String)>, AutomationError> {
        if keyword.trim().is_empty() {
            return Ok(None);
        }
        let Some(input) = self.locator.try_resolve(
            "patient search",
            self.elements,
            &strategies::patient_search_input(),
        )?
        else {
            debug!("No patient search box on the list page");
            return Ok(None);
        };

        let surface = self.elements.surface();
        surface.clear(&input.target)?;
        surface.type_text(&input.target, keyword)?;
        surface.press_enter(&input.target)?;

        match poll_until(
            self.locator.clock(),
            self.locator.control(),
            self.wait,
            &format!("search result for '{keyword}'"),
            || self.find_row(|text| text.contains(expect)),
        ) {
            Ok(row) => Ok(Some(row)),
            Err(AutomationError::Timeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn first_row(
        &self,
        record: &PatientRecord,
    ) -> Result<Option<(ElementHandle, String)>, AutomationError> {
        let Some(row) = self.locator.try_resolve(
            "newest patient row",
            self.elements,
            &strategies::first_patient_row(),
        )?
        else {
            return Ok(None);
        };
        let text = self.elements.surface().text(&row.target)?;
        if text.contains(record.chart_no.as_str()) || text.contains(record.name.as_str()) {
            Ok(Some((row.target, text)))
        } else {
            debug!("Newest row does not mention the patient: {}", text);
            Ok(None)
        }
    }

    fn best_scored(
        &self,
        record: &PatientRecord,
    ) -> Result<Option<(ElementHandle, String)>, AutomationError> {
        self.find_row(|text| match_score(record, text) >= MATCH_THRESHOLD)
    }

    /// First of the leading rows (per row selector) whose text satisfies `accept`.
    fn find_row<F>(&self, accept: F) -> Result<Option<(ElementHandle, String)>, AutomationError>
    where
        F: Fn(&str) -> bool,
    {
        let surface = self.elements.surface();
        for selector in strategies::patient_rows() {
            for row in surface.find_all(&selector)?.into_iter().take(MAX_ROWS_SCORED) {
                let text = surface.text(&row)?;
                if accept(text.trim()) {
                    return Ok(Some((row, text)));
                }
            }
        }
        Ok(None)
    }

    fn open(
        &self,
        (row, text): (ElementHandle, String),
        method: DetectionMethod,
    ) -> Result<Detection, AutomationError> {
        self.elements.surface().click(&row)?;
        let row_text: String = text.trim().chars().take(80).collect();
        info!("Selected patient row by {}: {}", method, row_text);
        Ok(Detection { method, row_text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn patient() -> PatientRecord {
        let mut record = PatientRecord::new(
            "홍길동",
            NaiveDate::from_ymd_opt(1990, 1, 2).unwrap(),
            "20431",
        );
        record.first_name = Some("길동".into());
        record.last_name = Some("홍".into());
        record
    }

    #[test]
    fn score_counts_populated_fields_only() {
        let record = PatientRecord::new(
            "김철수",
            NaiveDate::from_ymd_opt(1990, 1, 2).unwrap(),
            "777",
        );
        assert_eq!(match_score(&record, "777 김철수 1990-01-02"), 1.0);
        assert_eq!(match_score(&record, "777 이영희"), 0.5);
        assert_eq!(match_score(&record, "nothing"), 0.0);
    }

    #[test]
    fn half_of_fields_meets_threshold() {
        // chart number and family name match, full and given name do not
        let score = match_score(&patient(), "20431 | 홍OO | 1990-01-02");
        assert_eq!(score, 0.5);
        assert!(score >= MATCH_THRESHOLD);
        assert!(match_score(&patient(), "홍 | 99999") < MATCH_THRESHOLD);
    }
}
