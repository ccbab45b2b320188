//! Field extraction with a fixed precedence.
//!
//! Text: latin, then cyrillic, then arabic, then the MRZ value. Dates: the
//! visual-zone date, then the MRZ date. Blank strings and unreadable dates
//! count as absent. The same rule applies to every field.

use crate::types::{DateParts, DocumentData, LocalizedText, RawDocument};
use chrono::NaiveDate;

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl LocalizedText {
    /// The preferred script variant, if any is present.
    pub fn preferred(&self) -> Option<&str> {
        present(self.latin.as_ref())
            .or_else(|| present(self.cyrillic.as_ref()))
            .or_else(|| present(self.arabic.as_ref()))
    }
}

/// Resolve a text field: script variants first, then the MRZ-derived value.
pub fn resolve_text(field: &LocalizedText, mrz: Option<&String>) -> Option<String> {
    field
        .preferred()
        .or_else(|| present(mrz))
        .map(str::to_string)
}

/// Resolve a date field: the visual date first, then the MRZ-derived date.
pub fn resolve_date(visual: DateParts, mrz: Option<DateParts>) -> Option<NaiveDate> {
    visual.to_date().or_else(|| mrz.and_then(DateParts::to_date))
}

/// Apply precedence to every field of a raw document.
pub fn extract(raw: &RawDocument) -> DocumentData {
    let mrz = raw.mrz.as_ref();

    let first_name = resolve_text(&raw.first_name, mrz.and_then(|m| m.secondary_id.as_ref()));
    let last_name = resolve_text(&raw.last_name, mrz.and_then(|m| m.primary_id.as_ref()));
    let full_name = raw
        .full_name
        .preferred()
        .map(str::to_string)
        .or_else(|| match (&first_name, &last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        });

    DocumentData {
        date_of_birth: resolve_date(raw.date_of_birth, mrz.map(|m| m.date_of_birth)),
        date_of_expiry: resolve_date(raw.date_of_expiry, mrz.map(|m| m.date_of_expiry)),
        date_of_issue: resolve_date(raw.date_of_issue, None),
        document_number: resolve_text(
            &raw.document_number,
            mrz.and_then(|m| m.document_number.as_ref()),
        ),
        personal_id_number: resolve_text(
            &raw.personal_id_number,
            mrz.and_then(|m| m.personal_number.as_ref()),
        ),
        sex: resolve_text(&raw.sex, mrz.and_then(|m| m.gender.as_ref())),
        nationality: resolve_text(&raw.nationality, mrz.and_then(|m| m.nationality.as_ref())),
        place_of_birth: resolve_text(&raw.place_of_birth, None),
        address: resolve_text(&raw.address, None),
        issuing_authority: resolve_text(
            &raw.issuing_authority,
            mrz.and_then(|m| m.issuer.as_ref()),
        ),
        country_name: present(raw.country_name.as_ref()).map(str::to_string),
        mrz: raw.mrz.clone(),
        first_name,
        last_name,
        full_name,
    }
}
