// Compiled PHI detection patterns
// A pattern that fails to compile is `None`; the anonymizer treats that as a failed pass.

use std::sync::LazyLock;

use fancy_regex::Regex;

pub type Pattern = LazyLock<Option<Regex>>;

macro_rules! phi_pattern {
    ($name:ident, $regex:expr) => {
        pub static $name: Pattern = LazyLock::new(|| Regex::new($regex).ok());
    };
}

const MONTHS: &str = r"jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

// Identifiers. Group 1 is the literal to replace where a label is kept.
phi_pattern!(
    RE_MRN_LABELLED,
    r"(?i)\b(?:mrn|urn|ur\s*number|hospital\s*(?:number|no\.?)|medical\s*record\s*(?:number|no\.?)|record\s*(?:number|no\.?)|patient\s*id)\s*[:#]?\s*((?=[a-z0-9\-]*\d)[a-z0-9][a-z0-9\-]{3,})\b"
);
phi_pattern!(
    RE_NATIONAL_ID_LABELLED,
    r"(?i)\b(?:nhs|ssn|social\s+security|national\s+id|medicare|insurance)\s*(?:number|no\.?|#)?\s*[:#]?\s*(\d[\d \-]{6,}\d)\b"
);
phi_pattern!(RE_SSN, r"\b(\d{3}-\d{2}-\d{4})\b");
phi_pattern!(
    RE_EMAIL,
    r"([A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,})"
);
phi_pattern!(
    RE_PHONE,
    r"(?<![\w/.\-])((?:\+\d{1,3}[\s.\-]?)?(?:\(\d{2,5}\)\s?|\d{2,5}[\s.\-])\d{3,4}[\s.\-]?\d{3,4})(?![\w/\-])"
);
phi_pattern!(
    RE_LONG_ID,
    r"(?<![\w\-])((?:[A-Z]{1,3}\d{6,}|\d{7,}))(?![\w\-])"
);

// Dates. Numeric dates are day-first.
phi_pattern!(
    RE_DATE_NUMERIC,
    r"(?<![\w/\-])(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4}|\d{2})(?![\w/\-]|\.\d)"
);
phi_pattern!(
    RE_DATE_ISO,
    r"(?<![\w/\-])(\d{4})-(\d{1,2})-(\d{1,2})(?![\w/\-]|\.\d)"
);

pub static RE_DATE_DAY_MONTH: Pattern = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({MONTHS})\.?,?\s+(\d{{4}})\b"
    ))
    .ok()
});

pub static RE_DATE_MONTH_DAY: Pattern = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b({MONTHS})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"
    ))
    .ok()
});

phi_pattern!(
    RE_RELATIVE_AGO,
    r"(?i)\b(\d{1,3})\s*(d|days?|wks?|weeks?|mths?|months?|yrs?|years?)\s+(ago|prior|earlier|later|previously)\b"
);
phi_pattern!(
    RE_POST_OP_DAY,
    r"(?i)\b(?:pod\s*(\d{1,3})|post[\s\-]?op(?:erative)?\s+day\s*(\d{1,3}))\b"
);

// Locations
phi_pattern!(
    RE_FACILITY,
    r"\b((?:(?:St\.?|Saint)\s+)?(?:[A-Z][a-z]+(?:'s|')?\s+){1,4}(?:Hospital|Infirmary|Medical\s+Cent(?:re|er)|Health\s+Cent(?:re|er)|Clinic|Hospice|Nursing\s+Home|Care\s+Home|Surgery))\b"
);
phi_pattern!(
    RE_ADDRESS,
    r"\b(\d{1,5}[A-Za-z]?\s+(?:[A-Z][a-z]+\s+){1,3}(?:Street|St|Road|Rd|Avenue|Ave|Lane|Ln|Close|Way|Crescent|Court|Place|Boulevard|Blvd|Terrace|Gardens|Grove))\b"
);
phi_pattern!(
    RE_POSTCODE_UK,
    r"\b([A-Z]{1,2}\d[A-Z\d]?\s*\d[A-Z]{2})\b"
);
phi_pattern!(RE_ZIP_US, r"\b[A-Z]{2}\s+(\d{5}(?:-\d{4})?)\b");

// Names
phi_pattern!(
    RE_ROLE_NAME,
    r"\b(?i:(dr|doctor|prof|professor|mr|mrs|ms|miss|mx|nurse|sister|consultant|registrar|surgeon|patient|pt|mother|father|wife|husband|son|daughter|brother|partner|mum|dad|carer|guardian))\.?\s+([A-Z](?:'[A-Z])?[a-z][a-zA-Z'\-]*(?:\s+[A-Z](?:'[A-Z])?[a-z][a-zA-Z'\-]*)?)"
);
phi_pattern!(RE_POSSESSIVE, r"\b([A-Z][a-z]+)'s\b");
phi_pattern!(
    RE_SENTENCE_BIGRAM,
    r"(?:^|[.!?]\s+|\n\s*)([A-Z][a-z]+\s+[A-Z](?:'[A-Z])?[a-z][a-zA-Z'\-]*)\b"
);

/// Every pattern with a stable name, used for health checks
#[inline]
pub fn all_patterns() -> [(&'static str, &'static Pattern); 19] {
    [
        ("mrn_labelled", &RE_MRN_LABELLED),
        ("national_id_labelled", &RE_NATIONAL_ID_LABELLED),
        ("ssn", &RE_SSN),
        ("email", &RE_EMAIL),
        ("phone", &RE_PHONE),
        ("long_id", &RE_LONG_ID),
        ("date_numeric", &RE_DATE_NUMERIC),
        ("date_iso", &RE_DATE_ISO),
        ("date_day_month", &RE_DATE_DAY_MONTH),
        ("date_month_day", &RE_DATE_MONTH_DAY),
        ("relative_ago", &RE_RELATIVE_AGO),
        ("post_op_day", &RE_POST_OP_DAY),
        ("facility", &RE_FACILITY),
        ("address", &RE_ADDRESS),
        ("postcode_uk", &RE_POSTCODE_UK),
        ("zip_us", &RE_ZIP_US),
        ("role_name", &RE_ROLE_NAME),
        ("possessive", &RE_POSSESSIVE),
        ("sentence_bigram", &RE_SENTENCE_BIGRAM),
    ]
}

/// Month number from a month name or abbreviation
#[inline]
pub fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}
