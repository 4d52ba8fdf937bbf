use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptCategory {
    Procedure,
    Pathology,
    Imaging,
    Medication,
    Anatomy,
    Finding,
}

/// A canonical clinical concept found in free text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Concept {
    pub category: ConceptCategory,
    pub canonical: &'static str,
}

struct ConceptEntry {
    category: ConceptCategory,
    canonical: &'static str,
    surface_forms: &'static [&'static str],
}

const fn entry(
    category: ConceptCategory,
    canonical: &'static str,
    surface_forms: &'static [&'static str],
) -> ConceptEntry {
    ConceptEntry {
        category,
        canonical,
        surface_forms,
    }
}

use ConceptCategory::{Anatomy, Finding, Imaging, Medication, Pathology, Procedure};

static TAXONOMY: &[ConceptEntry] = &[
    // Procedures
    entry(Procedure, "craniotomy", &["craniotomy", "craniectomy"]),
    entry(Procedure, "clipping", &["clipping", "clipped", "clip ligation", "surgical clipping"]),
    entry(Procedure, "coiling", &["coiling", "coiled", "endovascular coiling", "coil embolisation", "coil embolization"]),
    entry(Procedure, "evd", &["evd", "external ventricular drain", "ventriculostomy"]),
    entry(Procedure, "lumbar drain", &["lumbar drain", "lumbar puncture", "lp"]),
    entry(Procedure, "shunt", &["shunt", "vp shunt", "ventriculoperitoneal shunt"]),
    entry(Procedure, "embolisation", &["embolisation", "embolization"]),
    entry(Procedure, "resection", &["resection", "excision", "debulking"]),
    entry(Procedure, "biopsy", &["biopsy"]),
    entry(Procedure, "intubation", &["intubation", "intubated"]),
    entry(Procedure, "tracheostomy", &["tracheostomy"]),
    entry(Procedure, "thrombectomy", &["thrombectomy"]),
    // Pathologies
    entry(Pathology, "subarachnoid haemorrhage", &["sah", "subarachnoid haemorrhage", "subarachnoid hemorrhage"]),
    entry(Pathology, "aneurysm", &["aneurysm", "aneurysmal"]),
    entry(Pathology, "intracerebral haemorrhage", &["ich", "intracerebral haemorrhage", "intracerebral hemorrhage"]),
    entry(Pathology, "subdural haematoma", &["sdh", "subdural", "subdural haematoma", "subdural hematoma"]),
    entry(Pathology, "extradural haematoma", &["edh", "extradural haematoma", "epidural hematoma"]),
    entry(Pathology, "hydrocephalus", &["hydrocephalus"]),
    entry(Pathology, "vasospasm", &["vasospasm"]),
    entry(Pathology, "tumour", &["tumour", "tumor", "glioma", "glioblastoma", "meningioma", "metastasis"]),
    entry(Pathology, "avm", &["avm", "arteriovenous malformation"]),
    entry(Pathology, "stroke", &["stroke", "infarct", "infarction", "dci"]),
    entry(Pathology, "traumatic brain injury", &["tbi", "traumatic brain injury", "head injury"]),
    // Imaging
    entry(Imaging, "ct", &["ct", "ct head", "computed tomography"]),
    entry(Imaging, "cta", &["cta", "ct angiogram", "ct angiography"]),
    entry(Imaging, "mri", &["mri", "mr", "magnetic resonance"]),
    entry(Imaging, "dsa", &["dsa", "angiogram", "angiography", "digital subtraction angiography"]),
    entry(Imaging, "doppler", &["doppler", "tcd", "transcranial doppler"]),
    // Medications
    entry(Medication, "nimodipine", &["nimodipine"]),
    entry(Medication, "aspirin", &["aspirin"]),
    entry(Medication, "clopidogrel", &["clopidogrel"]),
    entry(Medication, "levetiracetam", &["levetiracetam", "keppra"]),
    entry(Medication, "phenytoin", &["phenytoin"]),
    entry(Medication, "dexamethasone", &["dexamethasone"]),
    entry(Medication, "heparin", &["heparin", "enoxaparin"]),
    entry(Medication, "warfarin", &["warfarin"]),
    entry(Medication, "tranexamic acid", &["tranexamic acid", "txa"]),
    entry(Medication, "mannitol", &["mannitol"]),
    // Anatomy
    entry(Anatomy, "mca", &["mca", "middle cerebral artery"]),
    entry(Anatomy, "aca", &["aca", "anterior cerebral artery"]),
    entry(Anatomy, "acom", &["acom", "acomm", "anterior communicating artery"]),
    entry(Anatomy, "pcom", &["pcom", "pcomm", "posterior communicating artery"]),
    entry(Anatomy, "pca", &["pca", "posterior cerebral artery"]),
    entry(Anatomy, "ica", &["ica", "internal carotid artery"]),
    entry(Anatomy, "basilar", &["basilar", "basilar artery", "basilar tip"]),
    entry(Anatomy, "vertebral", &["vertebral", "vertebral artery", "pica"]),
    entry(Anatomy, "frontal", &["frontal", "frontal lobe"]),
    entry(Anatomy, "temporal", &["temporal", "temporal lobe"]),
    entry(Anatomy, "parietal", &["parietal", "parietal lobe"]),
    entry(Anatomy, "occipital", &["occipital", "occipital lobe"]),
    entry(Anatomy, "cerebellum", &["cerebellum", "cerebellar"]),
    entry(Anatomy, "ventricle", &["ventricle", "ventricles", "ventricular", "intraventricular"]),
    // Findings
    entry(Finding, "gcs", &["gcs", "glasgow coma scale"]),
    entry(Finding, "wfns grade", &["wfns"]),
    entry(Finding, "fisher grade", &["fisher", "modified fisher"]),
    entry(Finding, "hunt and hess", &["hunt and hess", "hunt hess"]),
    entry(Finding, "headache", &["headache", "thunderclap"]),
    entry(Finding, "seizure", &["seizure", "seizures", "fit"]),
    entry(Finding, "hemiparesis", &["hemiparesis", "weakness"]),
    entry(Finding, "midline shift", &["midline shift"]),
    entry(Finding, "mass effect", &["mass effect"]),
];

/// Extracts the set of taxonomy concepts mentioned in `text`.
///
/// Matching is done on whole lowercase tokens so that `"ca"` never matches inside `"mca"`.
#[inline]
pub fn extract_concepts(text: &str) -> BTreeSet<Concept> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return BTreeSet::new();
    }
    let padded = format!(" {} ", tokens.join(" "));

    TAXONOMY
        .iter()
        .filter(|entry| {
            entry
                .surface_forms
                .iter()
                .any(|form| padded.contains(&format!(" {} ", form)))
        })
        .map(|entry| Concept {
            category: entry.category,
            canonical: entry.canonical,
        })
        .collect()
}

/// Whether `term` (single or multi word) is a surface form in the taxonomy
#[inline]
pub fn is_clinical_term(term: &str) -> bool {
    let normalized = tokenize(term).join(" ");
    !normalized.is_empty()
        && TAXONOMY
            .iter()
            .any(|entry| entry.surface_forms.contains(&normalized.as_str()))
}
