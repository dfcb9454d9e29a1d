//! Regex pass — well-known shipping formats that don't need an LLM.
//!
//! Container numbers, B/L references, carrier names, the usual Chinese
//! loading ports and European discharge ports. Each recognized field earns
//! a weight; the sum is the pass's confidence score. A score at or above
//! the AI threshold skips the LLM call entirely.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::extract::{Extraction, ExtractionMethod};

static CONTAINER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([A-Z]{4}[0-9]{7})\b").expect("valid regex"));

static BILL_OF_LADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(BL[A-Z0-9\-]{6,15}|[A-Z]{4}[0-9]{9,12}|MEDUEN[0-9]+)\b")
        .expect("valid regex")
});

static SHIPPING_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(MSC|Maersk|Hapag[-\s]?Lloyd|Cosco|CMA\s*CGM|Evergreen|OOCL|Yang\s*Ming|ZIM|ONE)\b")
        .expect("valid regex")
});

static LOADING_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Shanghai|Ningbo|Qingdao|Shenzhen|Guangzhou|Tianjin|Xiamen|Dalian|Fuzhou|Yantian)\b")
        .expect("valid regex")
});

static DISCHARGE_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Constanta|Constanța|Rotterdam|Hamburg|Piraeus|Gdansk|Felixstowe)\b")
        .expect("valid regex")
});

static VESSEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:M/V|MV|VESSEL:?|Ship:?)\s+([A-Z][A-Za-z0-9 \-]+)").expect("valid regex")
});

static VOYAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:VOY|VOYAGE|VY)[\.:\s]\s*([A-Z0-9\-]+)").expect("valid regex")
});

static CONTAINER_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(20|40)\s*(?:ft|'|GP|DC|HC|HQ)\b").expect("valid regex")
});

static DATE_ISO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").expect("valid regex"));

static DEPARTURE_CONTEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ETD|departure|sailing|depart").expect("valid regex"));

static ARRIVAL_CONTEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ETA|arrival|arrive").expect("valid regex"));

static WEIGHT_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+\s*-\s*\d+\s*(?:t|ton)s?)\b").expect("valid regex")
});

static WEIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+(?:\.\d+)?\s*(?:kg|MT|tons?|t))\b").expect("valid regex")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid regex")
});

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\+?86[ \-]?)?1[3-9]\d{9}").expect("valid regex"));

/// Carrier name normalization. Senders write "yang ming", "CMA CGM",
/// "cmacgm" — bookings want one canonical spelling.
fn normalize_shipping_line(raw: &str) -> String {
    let collapsed = raw
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    match collapsed.as_str() {
        "msc" => "MSC",
        "maersk" => "Maersk",
        "hapag-lloyd" | "hapag lloyd" | "hapaglloyd" => "Hapag-Lloyd",
        "cosco" => "Cosco",
        "cma cgm" | "cmacgm" => "CMA CGM",
        "evergreen" => "Evergreen",
        "oocl" => "OOCL",
        "yang ming" | "yangming" => "Yangming",
        "zim" => "ZIM",
        "one" => "ONE",
        _ => return raw.to_string(),
    }
    .to_string()
}

/// Free-mail domains that are never a supplier's business address.
const FREE_MAIL_DOMAINS: &[&str] = &["gmail.com", "yahoo.com", "hotmail.com", "outlook.com"];

/// Field weights for the confidence score. Key identifiers carry more.
const WEIGHT_CONTAINER: u8 = 20;
const WEIGHT_BILL_OF_LADING: u8 = 15;
const WEIGHT_SHIPPING_LINE: u8 = 10;
const WEIGHT_PORT_OF_LOADING: u8 = 10;
const WEIGHT_PORT_OF_DISCHARGE: u8 = 10;
const WEIGHT_CONTAINER_TYPE: u8 = 10;
const WEIGHT_DEPARTURE_DATE: u8 = 5;
const WEIGHT_ETA: u8 = 5;
const WEIGHT_VESSEL: u8 = 5;
const WEIGHT_VOYAGE: u8 = 5;
const WEIGHT_SUPPLIER_EMAIL: u8 = 3;
const WEIGHT_SUPPLIER_PHONE: u8 = 2;

/// Run the regex pass over subject + body.
pub fn extract_with_patterns(subject: &str, body: &str) -> Extraction {
    let content = format!("{subject}\n{body}");
    let mut extracted = Extraction {
        method: ExtractionMethod::Regex,
        ..Default::default()
    };
    let mut earned: u8 = 0;

    if let Some(m) = CONTAINER_RE.find(&content) {
        extracted.container_number = Some(m.as_str().to_uppercase());
        earned += WEIGHT_CONTAINER;
    }

    // B/L: skip matches that are really the container number again
    for m in BILL_OF_LADING_RE.find_iter(&content) {
        let candidate = m.as_str().to_uppercase();
        if extracted.container_number.as_deref() != Some(candidate.as_str()) {
            extracted.bill_of_lading = Some(candidate);
            earned += WEIGHT_BILL_OF_LADING;
            break;
        }
    }

    if let Some(m) = SHIPPING_LINE_RE.find(&content) {
        extracted.shipping_line = Some(normalize_shipping_line(m.as_str()));
        earned += WEIGHT_SHIPPING_LINE;
    }

    if let Some(m) = LOADING_PORT_RE.find(&content) {
        extracted.port_of_loading = Some(capitalize(m.as_str()));
        earned += WEIGHT_PORT_OF_LOADING;
    }

    if let Some(m) = DISCHARGE_PORT_RE.find(&content) {
        extracted.port_of_discharge = Some(capitalize(m.as_str()));
        earned += WEIGHT_PORT_OF_DISCHARGE;
    }

    if let Some(caps) = VESSEL_RE.captures(&content) {
        if let Some(name) = caps.get(1) {
            extracted.vessel_name = Some(name.as_str().trim().to_string());
            earned += WEIGHT_VESSEL;
        }
    }

    if let Some(caps) = VOYAGE_RE.captures(&content) {
        if let Some(voyage) = caps.get(1) {
            extracted.voyage_number = Some(voyage.as_str().to_uppercase());
            earned += WEIGHT_VOYAGE;
        }
    }

    if let Some(caps) = CONTAINER_TYPE_RE.captures(&content) {
        let whole = caps.get(0).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let size = caps.get(1).map(|m| m.as_str()).unwrap_or("20");
        extracted.container_type = Some(if size == "40" {
            if whole.contains("hc") || whole.contains("hq") {
                "40ft_HC".to_string()
            } else {
                "40ft".to_string()
            }
        } else {
            "20ft".to_string()
        });
        earned += WEIGHT_CONTAINER_TYPE;
    }

    // Dates: classify each ISO date by the 30 bytes of context before it
    for m in DATE_ISO_RE.find_iter(&content) {
        let mut window_start = m.start().saturating_sub(30);
        while !content.is_char_boundary(window_start) {
            window_start -= 1;
        }
        let context = &content[window_start..m.start()];
        let date = NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok();
        let Some(date) = date else { continue };

        if extracted.departure_date.is_none() && DEPARTURE_CONTEXT_RE.is_match(context) {
            extracted.departure_date = Some(date);
            earned += WEIGHT_DEPARTURE_DATE;
        } else if extracted.eta.is_none() && ARRIVAL_CONTEXT_RE.is_match(context) {
            extracted.eta = Some(date);
            earned += WEIGHT_ETA;
        }
    }

    // Weight: prefer a range ("10-20t") over a single figure
    if let Some(m) = WEIGHT_RANGE_RE.find(&content) {
        extracted.weight = Some(m.as_str().to_string());
    } else if let Some(m) = WEIGHT_RE.find(&content) {
        extracted.weight = Some(m.as_str().to_string());
    }

    for m in EMAIL_RE.find_iter(&content) {
        let address = m.as_str().to_lowercase();
        let is_free_mail = FREE_MAIL_DOMAINS.iter().any(|d| address.ends_with(d));
        if !is_free_mail {
            extracted.supplier_email = Some(address);
            earned += WEIGHT_SUPPLIER_EMAIL;
            break;
        }
    }

    if let Some(m) = PHONE_RE.find(&content) {
        extracted.supplier_phone = Some(m.as_str().to_string());
        earned += WEIGHT_SUPPLIER_PHONE;
    }

    extracted.confidence = earned.min(100);
    extracted
}

/// Uppercase the first letter, keeping the rest as matched.
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
