// PHI anonymizer
// Heuristic, best-effort redaction of identifiers, dates, locations and names

pub mod dictionaries;
pub mod patterns;


use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use fancy_regex::Captures;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::feedback::FieldValue;
use dictionaries::{NameRole, is_allowed, is_common_word, is_first_name, role_for_prefix};
use patterns::Pattern;

/// Replacement used when a pass fails and the text cannot be scrubbed safely
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// Text that has been through the [`Anonymizer`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Redacted(String);

impl Redacted {
    /// Wraps text that is already known to be scrubbed, such as rows read back from storage.
    #[inline]
    pub(crate) fn from_trusted(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn into_inner(self) -> String {
        self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Redacted {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Redacted {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymizeOptions {
    /// Absolute dates become signed day offsets from this date
    pub reference_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymizationMetadata {
    pub items_anonymized: usize,
    pub names_replaced: usize,
    pub dates_replaced: usize,
    pub ids_replaced: usize,
    pub locations_replaced: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymizationResult {
    pub anonymized: Redacted,
    pub metadata: AnonymizationMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhiType {
    Identifier,
    Date,
    Location,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhiReport {
    pub has_phi: bool,
    pub types: Vec<PhiType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TokenCategory {
    Mrn,
    Phone,
    Email,
    NationalId,
    Id,
    Facility,
    Address,
    Postcode,
    Patient,
    Clinician,
    Relative,
    Name,
}

impl TokenCategory {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Mrn => "MRN",
            Self::Phone => "PHONE",
            Self::Email => "EMAIL",
            Self::NationalId => "NATIONAL_ID",
            Self::Id => "ID",
            Self::Facility => "FACILITY",
            Self::Address => "ADDRESS",
            Self::Postcode => "POSTCODE",
            Self::Patient => "PATIENT",
            Self::Clinician => "CLINICIAN",
            Self::Relative => "RELATIVE",
            Self::Name => "NAME",
        }
    }

    const fn phi_type(self) -> PhiType {
        match self {
            Self::Mrn | Self::Phone | Self::Email | Self::NationalId | Self::Id => {
                PhiType::Identifier
            }
            Self::Facility | Self::Address | Self::Postcode => PhiType::Location,
            Self::Patient | Self::Clinician | Self::Relative | Self::Name => PhiType::Name,
        }
    }

    const fn from_role(role: NameRole) -> Self {
        match role {
            NameRole::Clinician => Self::Clinician,
            NameRole::Patient => Self::Patient,
            NameRole::Relative => Self::Relative,
        }
    }
}

#[derive(Debug, Clone)]
enum Replacement {
    /// Numbered, cached token such as `[MRN_1]`
    Token { category: TokenCategory, raw: String },
    /// Precomputed text; `counts_as` is `None` for format normalisation
    Fixed {
        text: String,
        counts_as: Option<PhiType>,
    },
}

#[derive(Debug, Clone)]
struct Candidate {
    start: usize,
    end: usize,
    replacement: Replacement,
}

impl Candidate {
    fn phi_type(&self) -> Option<PhiType> {
        match &self.replacement {
            Replacement::Token { category, .. } => Some(category.phi_type()),
            Replacement::Fixed { counts_as, .. } => *counts_as,
        }
    }
}

#[derive(Debug)]
struct PassFailure {
    pattern: &'static str,
    reason: String,
}

type PassResult = Result<Vec<Candidate>, PassFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    LabelledIdentifiers,
    KnownIdentifiers,
    Identifiers,
    Dates,
    Locations,
    RoleNames,
    PossessiveNames,
    BigramNames,
    KnownNames,
}

/// Fixed pass order: identifiers, then dates, then locations, then names.
const STEPS: [Step; 9] = [
    Step::LabelledIdentifiers,
    Step::KnownIdentifiers,
    Step::Identifiers,
    Step::Dates,
    Step::Locations,
    Step::RoleNames,
    Step::PossessiveNames,
    Step::BigramNames,
    Step::KnownNames,
];

/// Session-scoped PHI scrubber.
///
/// Raw values map to stable tokens for the lifetime of the instance so repeated
/// mentions of the same person or identifier share one token. Call
/// [`Anonymizer::clear_caches`] between unrelated patients.
#[derive(Debug, Default)]
pub struct Anonymizer {
    tokens: HashMap<(TokenCategory, String), String>,
    counters: HashMap<TokenCategory, usize>,
    /// Literal mentions already tokenised, matched again on later text
    known_identifiers: HashMap<String, String>,
    known_names: HashMap<String, String>,
}

impl Anonymizer {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scrubs `text`. Never fails; a pass that cannot run redacts the whole text.
    #[inline]
    pub fn anonymize(&mut self, text: &str, options: &AnonymizeOptions) -> AnonymizationResult {
        if text.trim().is_empty() {
            return AnonymizationResult {
                anonymized: Redacted::default(),
                metadata: AnonymizationMetadata::default(),
            };
        }

        let mut current = text.to_string();
        let mut metadata = AnonymizationMetadata::default();

        for step in STEPS {
            let candidates = match self.detect(step, &current, options) {
                Ok(candidates) => candidates,
                Err(failure) => {
                    warn!(
                        "Anonymizer pattern '{}' failed ({}); redacting {} chars conservatively",
                        failure.pattern,
                        failure.reason,
                        text.len()
                    );
                    return AnonymizationResult {
                        anonymized: Redacted(REDACTED_PLACEHOLDER.to_string()),
                        metadata: AnonymizationMetadata {
                            items_anonymized: 1,
                            ..AnonymizationMetadata::default()
                        },
                    };
                }
            };
            current = self.apply(&current, candidates, &mut metadata);
        }

        metadata.items_anonymized = metadata.names_replaced
            + metadata.dates_replaced
            + metadata.ids_replaced
            + metadata.locations_replaced;

        debug!(
            "Anonymized {} chars, {} items replaced",
            text.len(),
            metadata.items_anonymized
        );

        AnonymizationResult {
            anonymized: Redacted(current),
            metadata,
        }
    }

    /// Convenience wrapper returning only the scrubbed text
    #[inline]
    pub fn scrub(&mut self, text: &str, options: &AnonymizeOptions) -> Redacted {
        self.anonymize(text, options).anonymized
    }

    /// Scrubs every text leaf of a field value
    #[inline]
    pub fn anonymize_value(&mut self, value: &FieldValue, options: &AnonymizeOptions) -> FieldValue {
        match value {
            FieldValue::Scalar(text) => {
                FieldValue::Scalar(self.anonymize(text, options).anonymized.into_inner())
            }
            FieldValue::List(items) => FieldValue::List(
                items
                    .iter()
                    .map(|item| self.anonymize(item, options).anonymized.into_inner())
                    .collect(),
            ),
            FieldValue::Structured(fields) => FieldValue::Structured(
                fields
                    .iter()
                    .map(|(key, inner)| (key.clone(), self.anonymize_value(inner, options)))
                    .collect(),
            ),
        }
    }

    /// Reports which PHI categories `text` appears to contain, without touching the caches.
    #[inline]
    pub fn contains_phi(&self, text: &str) -> PhiReport {
        if text.trim().is_empty() {
            return PhiReport {
                has_phi: false,
                types: Vec::new(),
            };
        }

        let options = AnonymizeOptions::default();
        let mut types = BTreeSet::new();
        for step in STEPS {
            match self.detect(step, text, &options) {
                Ok(candidates) => types.extend(candidates.iter().filter_map(Candidate::phi_type)),
                // A failing pass cannot prove the text is clean
                Err(_) => {
                    types.insert(PhiType::Identifier);
                }
            }
        }

        PhiReport {
            has_phi: !types.is_empty(),
            types: types.into_iter().collect(),
        }
    }

    #[inline]
    pub fn clear_caches(&mut self) {
        self.tokens.clear();
        self.counters.clear();
        self.known_identifiers.clear();
        self.known_names.clear();
        debug!("Anonymizer caches cleared");
    }

    /// Number of distinct raw values currently mapped to tokens
    #[inline]
    pub fn cached_values(&self) -> usize {
        self.tokens.len()
    }

    fn detect(&self, step: Step, text: &str, options: &AnonymizeOptions) -> PassResult {
        match step {
            Step::LabelledIdentifiers => {
                let mut found = captures(
                    "mrn_labelled",
                    &patterns::RE_MRN_LABELLED,
                    text,
                    |caps| token_at(caps, 1, TokenCategory::Mrn),
                )?;
                found.extend(captures(
                    "national_id_labelled",
                    &patterns::RE_NATIONAL_ID_LABELLED,
                    text,
                    |caps| token_at(caps, 1, TokenCategory::NationalId),
                )?);
                Ok(found)
            }
            Step::KnownIdentifiers => Ok(known_mentions(text, &self.known_identifiers, |token| {
                Replacement::Fixed {
                    text: token.to_string(),
                    counts_as: Some(PhiType::Identifier),
                }
            })),
            Step::Identifiers => {
                let mut found =
                    captures("email", &patterns::RE_EMAIL, text, |caps| {
                        token_at(caps, 1, TokenCategory::Email)
                    })?;
                found.extend(captures("ssn", &patterns::RE_SSN, text, |caps| {
                    token_at(caps, 1, TokenCategory::NationalId)
                })?);
                found.extend(captures("phone", &patterns::RE_PHONE, text, |caps| {
                    token_at(caps, 1, TokenCategory::Phone)
                })?);
                found.extend(captures("long_id", &patterns::RE_LONG_ID, text, |caps| {
                    token_at(caps, 1, TokenCategory::Id)
                })?);
                Ok(found)
            }
            Step::Dates => detect_dates(text, options.reference_date),
            Step::Locations => {
                let mut found = captures("facility", &patterns::RE_FACILITY, text, |caps| {
                    let m = caps.get(1)?;
                    let name_words: Vec<&str> = m
                        .as_str()
                        .split_whitespace()
                        .take_while(|w| !is_facility_suffix(w))
                        .collect();
                    if name_words.iter().all(|w| is_allowed(w) || is_common_word(w)) {
                        return None;
                    }
                    token_at(caps, 1, TokenCategory::Facility)
                })?;
                found.extend(captures("address", &patterns::RE_ADDRESS, text, |caps| {
                    token_at(caps, 1, TokenCategory::Address)
                })?);
                found.extend(captures(
                    "postcode_uk",
                    &patterns::RE_POSTCODE_UK,
                    text,
                    |caps| token_at(caps, 1, TokenCategory::Postcode),
                )?);
                found.extend(captures("zip_us", &patterns::RE_ZIP_US, text, |caps| {
                    token_at(caps, 1, TokenCategory::Postcode)
                })?);
                Ok(found)
            }
            Step::RoleNames => captures("role_name", &patterns::RE_ROLE_NAME, text, |caps| {
                let role = role_for_prefix(caps.get(1)?.as_str())?;
                let name = caps.get(2)?;
                let (start, raw) = name_span(name.start(), name.as_str())?;
                Some(Candidate {
                    start,
                    end: start + raw.len(),
                    replacement: Replacement::Token {
                        category: TokenCategory::from_role(role),
                        raw: raw.to_string(),
                    },
                })
            }),
            Step::PossessiveNames => captures("possessive", &patterns::RE_POSSESSIVE, text, |caps| {
                let name = caps.get(1)?.as_str();
                (is_first_name(name) && !is_allowed(name) && !self.known_names.contains_key(name))
                    .then(|| token_at(caps, 1, TokenCategory::Name))
                    .flatten()
            }),
            Step::BigramNames => {
                captures("sentence_bigram", &patterns::RE_SENTENCE_BIGRAM, text, |caps| {
                    let bigram = caps.get(1)?;
                    let mut words = bigram.as_str().split_whitespace();
                    let (first, second) = (words.next()?, words.next()?);
                    let is_name = is_first_name(first)
                        && !self.known_names.contains_key(first)
                        && !is_allowed(first)
                        && !is_allowed(second)
                        && !is_common_word(second);
                    is_name.then(|| token_at(caps, 1, TokenCategory::Name)).flatten()
                })
            }
            Step::KnownNames => Ok(known_mentions(text, &self.known_names, |token| {
                Replacement::Fixed {
                    text: token.to_string(),
                    counts_as: Some(PhiType::Name),
                }
            })),
        }
    }

    /// Resolves tokens and splices candidates into `text`, skipping overlaps and existing tokens.
    fn apply(
        &mut self,
        text: &str,
        mut candidates: Vec<Candidate>,
        metadata: &mut AnonymizationMetadata,
    ) -> String {
        if candidates.is_empty() {
            return text.to_string();
        }

        candidates.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

        let mut output = String::with_capacity(text.len());
        let mut cursor = 0;

        for candidate in candidates {
            if candidate.start < cursor
                || candidate.end > text.len()
                || within_token(text, candidate.start, candidate.end)
            {
                continue;
            }

            let counts_as = candidate.phi_type();
            let replacement = match candidate.replacement {
                Replacement::Token { category, raw } => self.token_for(category, &raw),
                Replacement::Fixed { text, .. } => text,
            };

            output.push_str(&text[cursor..candidate.start]);
            output.push_str(&replacement);
            cursor = candidate.end;

            match counts_as {
                Some(PhiType::Identifier) => metadata.ids_replaced += 1,
                Some(PhiType::Date) => metadata.dates_replaced += 1,
                Some(PhiType::Location) => metadata.locations_replaced += 1,
                Some(PhiType::Name) => metadata.names_replaced += 1,
                None => {}
            }
        }

        output.push_str(&text[cursor..]);
        output
    }

    fn token_for(&mut self, category: TokenCategory, raw: &str) -> String {
        let key = cache_key(category, raw);
        if let Some(token) = self.tokens.get(&(category, key.clone())) {
            return token.clone();
        }

        let counter = self.counters.entry(category).or_insert(0);
        *counter += 1;
        let token = format!("[{}_{}]", category.prefix(), counter);
        self.tokens.insert((category, key), token.clone());

        match category.phi_type() {
            PhiType::Identifier => {
                self.known_identifiers
                    .insert(raw.trim().to_string(), token.clone());
            }
            PhiType::Name => {
                for part in raw.split_whitespace() {
                    let part = part.trim_end_matches("'s");
                    if part.chars().count() >= 3 && !is_allowed(part) && !is_common_word(part) {
                        self.known_names
                            .entry(part.to_string())
                            .or_insert_with(|| token.clone());
                    }
                }
            }
            PhiType::Date | PhiType::Location => {}
        }

        token
    }
}

fn cache_key(category: TokenCategory, raw: &str) -> String {
    match category {
        TokenCategory::Phone | TokenCategory::NationalId => {
            raw.chars().filter(char::is_ascii_alphanumeric).collect()
        }
        TokenCategory::Postcode => raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase(),
        _ => raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
    }
}

fn captures<F>(name: &'static str, pattern: &'static Pattern, text: &str, mut build: F) -> PassResult
where
    F: FnMut(&Captures<'_>) -> Option<Candidate>,
{
    let Some(regex) = pattern.as_ref() else {
        return Err(PassFailure {
            pattern: name,
            reason: "pattern failed to compile".to_string(),
        });
    };

    let mut found = Vec::new();
    for caps in regex.captures_iter(text) {
        let caps = caps.map_err(|e| PassFailure {
            pattern: name,
            reason: e.to_string(),
        })?;
        if let Some(candidate) = build(&caps) {
            found.push(candidate);
        }
    }
    Ok(found)
}

fn token_at(caps: &Captures<'_>, group: usize, category: TokenCategory) -> Option<Candidate> {
    let m = caps.get(group)?;
    let raw = m.as_str().trim_end();
    if raw.is_empty() {
        return None;
    }
    Some(Candidate {
        start: m.start(),
        end: m.start() + raw.len(),
        replacement: Replacement::Token {
            category,
            raw: raw.to_string(),
        },
    })
}

/// Trims trailing possessives and non-name words from a role-prefixed name.
/// Returns `None` when nothing name-like remains.
fn name_span(start: usize, raw: &str) -> Option<(usize, &str)> {
    let mut words: Vec<&str> = raw.split_whitespace().collect();
    while let Some(last) = words.last() {
        if is_common_word(last) || is_allowed(last) {
            words.pop();
        } else {
            break;
        }
    }
    let first = words.first()?;
    if is_common_word(first) || is_allowed(first) {
        return None;
    }

    let last = words.last()?;
    let last_offset = raw.find(last)?;
    let mut end = last_offset + last.len();
    if raw[..end].ends_with("'s") {
        end -= 2;
    }
    let span = raw[..end].trim_end_matches(['\'', '-']);
    (!span.is_empty()).then_some((start, span))
}

fn is_facility_suffix(word: &str) -> bool {
    matches!(
        word,
        "Hospital" | "Infirmary" | "Medical" | "Health" | "Clinic" | "Hospice" | "Nursing" | "Care"
            | "Surgery"
    )
}

/// True when the span sits inside an existing `[TOKEN]`
fn within_token(text: &str, start: usize, end: usize) -> bool {
    let before = &text[..start];
    let open = before.rfind('[');
    let close = before.rfind(']');
    let opened = match (open, close) {
        (Some(o), Some(c)) => o > c,
        (Some(_), None) => true,
        _ => false,
    };
    if !opened {
        return false;
    }
    let after = &text[end..];
    match (after.find(']'), after.find('[')) {
        (Some(c), Some(o)) => c < o,
        (Some(_), None) => true,
        _ => false,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-word occurrences of literals that earlier text already tokenised
fn known_mentions<F>(text: &str, known: &HashMap<String, String>, replacement: F) -> Vec<Candidate>
where
    F: Fn(&str) -> Replacement,
{
    let mut found = Vec::new();
    for (literal, token) in known {
        if literal.is_empty() {
            continue;
        }
        for (start, _) in text.match_indices(literal.as_str()) {
            let end = start + literal.len();
            let boundary_before = text[..start].chars().next_back().is_none_or(|c| !is_word_char(c));
            let boundary_after = text[end..].chars().next().is_none_or(|c| !is_word_char(c));
            if boundary_before && boundary_after {
                found.push(Candidate {
                    start,
                    end,
                    replacement: replacement(token),
                });
            }
        }
    }
    found
}

fn detect_dates(text: &str, reference: Option<NaiveDate>) -> PassResult {
    let mut found = captures("date_numeric", &patterns::RE_DATE_NUMERIC, text, |caps| {
        let day = parse_group(caps, 1)?;
        let month = parse_group(caps, 2)?;
        let year = expand_year(caps.get(3)?.as_str())?;
        Some(date_candidate(caps, NaiveDate::from_ymd_opt(year, month, day), reference))
    })?;
    found.extend(captures("date_iso", &patterns::RE_DATE_ISO, text, |caps| {
        let year = i32::try_from(parse_group(caps, 1)?).ok()?;
        let month = parse_group(caps, 2)?;
        let day = parse_group(caps, 3)?;
        Some(date_candidate(caps, NaiveDate::from_ymd_opt(year, month, day), reference))
    })?);
    found.extend(captures(
        "date_day_month",
        &patterns::RE_DATE_DAY_MONTH,
        text,
        |caps| {
            let day = parse_group(caps, 1)?;
            let month = patterns::month_number(caps.get(2)?.as_str())?;
            let year = i32::try_from(parse_group(caps, 3)?).ok()?;
            Some(date_candidate(caps, NaiveDate::from_ymd_opt(year, month, day), reference))
        },
    )?);
    found.extend(captures(
        "date_month_day",
        &patterns::RE_DATE_MONTH_DAY,
        text,
        |caps| {
            let month = patterns::month_number(caps.get(1)?.as_str())?;
            let day = parse_group(caps, 2)?;
            let year = i32::try_from(parse_group(caps, 3)?).ok()?;
            Some(date_candidate(caps, NaiveDate::from_ymd_opt(year, month, day), reference))
        },
    )?);

    found.extend(captures("relative_ago", &patterns::RE_RELATIVE_AGO, text, |caps| {
        let whole = caps.get(0)?;
        let amount: u32 = caps.get(1)?.as_str().parse().ok()?;
        let unit = normalise_unit(caps.get(2)?.as_str(), amount)?;
        let direction = caps.get(3)?.as_str().to_lowercase();
        Some(Candidate {
            start: whole.start(),
            end: whole.end(),
            replacement: Replacement::Fixed {
                text: format!("{amount} {unit} {direction}"),
                counts_as: None,
            },
        })
    })?);
    found.extend(captures("post_op_day", &patterns::RE_POST_OP_DAY, text, |caps| {
        let whole = caps.get(0)?;
        let day = caps.get(1).or_else(|| caps.get(2))?.as_str();
        Some(Candidate {
            start: whole.start(),
            end: whole.end(),
            replacement: Replacement::Fixed {
                text: format!("post-operative day {day}"),
                counts_as: None,
            },
        })
    })?);

    Ok(found)
}

fn parse_group(caps: &Captures<'_>, group: usize) -> Option<u32> {
    caps.get(group)?.as_str().parse().ok()
}

/// Two-digit years pivot at 50
fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    Some(match raw.len() {
        2 if year < 50 => 2000 + year,
        2 => 1900 + year,
        _ => year,
    })
}

fn date_candidate(
    caps: &Captures<'_>,
    date: Option<NaiveDate>,
    reference: Option<NaiveDate>,
) -> Candidate {
    let (start, end) = caps.get(0).map_or((0, 0), |m| (m.start(), m.end()));
    let text = match (date, reference) {
        (Some(date), Some(reference)) => {
            let offset = date.signed_duration_since(reference).num_days();
            if offset < 0 {
                format!("[DAY{offset}]")
            } else {
                format!("[DAY+{offset}]")
            }
        }
        _ => "[DATE]".to_string(),
    };
    Candidate {
        start,
        end,
        replacement: Replacement::Fixed {
            text,
            counts_as: Some(PhiType::Date),
        },
    }
}

fn normalise_unit(raw: &str, amount: u32) -> Option<&'static str> {
    let lowered = raw.to_lowercase();
    let singular = match lowered.as_str() {
        "d" | "day" | "days" => "day",
        "wk" | "wks" | "week" | "weeks" => "week",
        "mth" | "mths" | "month" | "months" => "month",
        "yr" | "yrs" | "year" | "years" => "year",
        _ => return None,
    };
    Some(match (singular, amount == 1) {
        (unit, true) => unit,
        ("day", false) => "days",
        ("week", false) => "weeks",
        ("month", false) => "months",
        _ => "years",
    })
}
