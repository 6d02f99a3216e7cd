use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::AutomationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M", alias = "male", alias = "MALE", alias = "남", alias = "남자")]
    Male,
    #[serde(rename = "F", alias = "female", alias = "FEMALE", alias = "여", alias = "여자")]
    Female,
}

impl Gender {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "M" | "MALE" | "남" | "남자" => Some(Gender::Male),
            "F" | "FEMALE" | "여" | "여자" => Some(Gender::Female),
            _ => None,
        }
    }

    /// Option value used by the remote patient form.
    pub fn code(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
        }
    }

    /// Option label shown by the remote patient form.
    pub fn label(&self) -> &'static str {
        match self {
            Gender::Male => "남자",
            Gender::Female => "여자",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Patient data recognized from the desktop application's chart view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub name: String,
    pub birth_date: NaiveDate,
    /// Chart number in the practice-management system
    pub chart_no: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PatientRecord {
    pub fn new(name: &str, birth_date: NaiveDate, chart_no: &str) -> Self {
        Self {
            name: name.to_string(),
            birth_date,
            chart_no: chart_no.to_string(),
            phone: None,
            gender: None,
            first_name: None,
            last_name: None,
            email: None,
            notes: None,
        }
    }

    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.name.trim().is_empty() {
            return Err(AutomationError::InvalidArgument(
                "patient name is empty".to_string(),
            ));
        }
        if self.chart_no.trim().is_empty() {
            return Err(AutomationError::InvalidArgument(
                "patient chart number is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `(last, first)` name parts. Explicit fields win; otherwise the first
    /// character of a Korean full name is the family name.
    pub fn name_parts(&self) -> (String, String) {
        if let (Some(last), Some(first)) = (&self.last_name, &self.first_name) {
            return (last.clone(), first.clone());
        }
        let name = self.name.trim();
        let mut chars = name.chars();
        match chars.next() {
            Some(family) if name.chars().count() >= 2 => {
                (family.to_string(), chars.as_str().to_string())
            }
            _ => (name.to_string(), String::new()),
        }
    }

    pub fn birth_date_text(&self) -> String {
        self.birth_date.format("%Y-%m-%d").to_string()
    }
}
