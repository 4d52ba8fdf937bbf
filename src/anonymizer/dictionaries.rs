use std::collections::HashSet;
use std::sync::LazyLock;

use crate::similarity::concepts;

/// Role a prefix word assigns to the name that follows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRole {
    Clinician,
    Patient,
    Relative,
}

#[inline]
pub fn role_for_prefix(prefix: &str) -> Option<NameRole> {
    let prefix = prefix.trim_end_matches('.').to_lowercase();
    match prefix.as_str() {
        "dr" | "doctor" | "prof" | "professor" | "nurse" | "sister" | "consultant" | "registrar"
        | "surgeon" => Some(NameRole::Clinician),
        "mr" | "mrs" | "ms" | "miss" | "mx" | "patient" | "pt" => Some(NameRole::Patient),
        "mother" | "father" | "wife" | "husband" | "son" | "daughter" | "brother" | "partner"
        | "mum" | "dad" | "carer" | "guardian" => Some(NameRole::Relative),
        _ => None,
    }
}

static FIRST_NAMES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "james", "john", "robert", "michael", "william", "david", "richard", "joseph", "thomas",
        "charles", "christopher", "daniel", "matthew", "anthony", "mark", "donald", "steven",
        "paul", "andrew", "joshua", "kenneth", "kevin", "brian", "george", "timothy", "ronald",
        "edward", "jason", "jeffrey", "ryan", "jacob", "gary", "nicholas", "eric", "jonathan",
        "stephen", "larry", "justin", "scott", "brandon", "benjamin", "samuel", "gregory",
        "alexander", "frank", "patrick", "raymond", "jack", "dennis", "jerry", "tyler", "aaron",
        "jose", "adam", "nathan", "henry", "peter", "zachary", "douglas", "harold", "kyle",
        "walter", "ethan", "jeremy", "harry", "oliver", "noah", "liam", "lucas", "oscar", "alfie",
        "arthur", "leo", "freddie", "archie", "ian", "graham", "colin", "keith", "stuart",
        "alan", "neil", "trevor", "barry", "derek", "mohammed", "muhammad", "ahmed", "ali",
        "omar", "raj", "sanjay", "arjun", "wei", "hiroshi", "mary", "patricia", "jennifer",
        "linda", "elizabeth", "barbara", "susan", "jessica", "sarah", "karen", "lisa", "nancy",
        "betty", "margaret", "sandra", "ashley", "kimberly", "emily", "donna", "michelle",
        "carol", "amanda", "dorothy", "melissa", "deborah", "stephanie", "rebecca", "sharon",
        "laura", "cynthia", "kathleen", "amy", "angela", "shirley", "anna", "brenda", "pamela",
        "emma", "nicole", "helen", "samantha", "katherine", "christine", "debra", "rachel",
        "carolyn", "janet", "catherine", "maria", "heather", "diane", "ruth", "julie", "olivia",
        "joyce", "virginia", "victoria", "kelly", "lauren", "christina", "joan", "evelyn",
        "judith", "megan", "andrea", "cheryl", "hannah", "jacqueline", "martha", "gloria",
        "teresa", "ann", "sophie", "sophia", "amelia", "isla", "ava", "mia", "grace", "lily",
        "charlotte", "chloe", "ella", "jane", "joanne", "claire", "gillian", "fiona", "aisha",
        "fatima", "priya", "mei", "yuki", "eileen", "maureen", "doris", "edna", "irene", "jean",
    ]
    .into_iter()
    .collect()
});

/// Capitalised words that commonly follow a role word without being a name
static COMMON_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "the", "a", "an", "is", "was", "has", "had", "have", "and", "or", "but", "with", "without",
        "for", "from", "to", "in", "on", "at", "of", "by", "presented", "presents", "seen",
        "reviewed", "reports", "reported", "states", "stated", "denies", "admitted", "underwent",
        "remains", "remained", "required", "requires", "agreed", "declined", "consented", "said",
        "notes", "noted", "called", "contacted", "informed", "practitioner", "specialist",
        "team", "ward", "unit", "today", "yesterday", "tomorrow", "after", "before", "then",
        "also", "who", "which", "his", "her", "their", "this", "that", "history", "plan",
        "examination", "impression", "assessment", "summary", "discharge", "admission", "on-call",
        "left", "right", "bilateral", "post-op", "day", "night", "morning", "evening",
    ]
    .into_iter()
    .collect()
});

/// Clinical vocabulary that is never redacted, including eponyms that look like surnames
static CLINICAL_ALLOW_LIST: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "craniotomy", "craniectomy", "aspirin", "sah", "mca", "aca", "ica", "pca", "acom",
        "pcom", "evd", "cta", "dsa", "ct", "mri", "gcs", "wfns", "fisher", "hunt", "hess",
        "glasgow", "nimodipine", "paracetamol", "levetiracetam", "keppra", "dexamethasone",
        "heparin", "clopidogrel", "warfarin", "coiling", "clipping", "aneurysm", "haemorrhage",
        "hemorrhage", "hydrocephalus", "vasospasm", "parkinson", "alzheimer", "babinski",
        "romberg", "willis", "sylvian", "monro", "doppler", "foley", "hartmann", "whipple",
        "crohn", "addison", "cushing", "graves", "bell", "marfan", "ehlers", "danlos",
        "rankin", "barthel", "spetzler", "neurosurgery", "neurology", "neurosurgical",
        "neuroradiology", "radiology", "cardiology", "oncology", "stroke", "trauma", "emergency",
        "outpatient", "outpatients", "fracture", "acute", "intensive", "care", "day",
        "general", "district", "royal", "university", "children", "community",
    ]
    .into_iter()
    .collect()
});

#[inline]
pub fn is_first_name(word: &str) -> bool {
    FIRST_NAMES.contains(word.to_lowercase().as_str())
}

#[inline]
pub fn is_common_word(word: &str) -> bool {
    COMMON_WORDS.contains(word.to_lowercase().as_str())
}

/// True for words the name and location passes must leave untouched
#[inline]
pub fn is_allowed(word: &str) -> bool {
    let lowered = word.trim_end_matches("'s").to_lowercase();
    CLINICAL_ALLOW_LIST.contains(lowered.as_str()) || concepts::is_clinical_term(&lowered)
}
