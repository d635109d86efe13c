use std::sync::LazyLock;

use regex::Regex;

use crate::model::PriceRecord;

static FECHA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)fecha de plaza").unwrap());
// 12,500 / 1,234,567 / 1,234.50
static GROUPED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d{1,3}(,\d{3})+(\.\d+)?$").unwrap());
// 120,5 / 130,25 / ,75
static DECIMAL_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[+-]?\d*,\d+$").unwrap());

const AMOUNT_COLUMNS: usize = 4;
const MIN_TOKENS: usize = AMOUNT_COLUMNS + 1;

/// Line-by-line state for one document: the in-force `fecha de plaza`
/// carries forward until a later marker replaces it.
pub struct LineParser {
    fecha: Option<String>,
    fallback: String,
}

impl LineParser {
    /// `fallback` is used for rows seen before any date marker.
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            fecha: None,
            fallback: fallback.into(),
        }
    }

    pub fn in_force(&self) -> &str {
        self.fecha.as_deref().unwrap_or(&self.fallback)
    }

    /// Date capture and row capture are independent: a marker line is still
    /// offered to the row parser.
    pub fn feed(&mut self, line: &str) -> Option<PriceRecord> {
        if let Some(fecha) = date_marker(line) {
            // A blank marker clears the date; later rows fall back.
            self.fecha = Some(fecha).filter(|f| !f.is_empty());
        }
        let row = parse_row(line)?;
        Some(row.into_record(self.in_force()))
    }
}

/// Text after the first colon of a "fecha de plaza" line, possibly empty.
/// `None` when the line is not a marker or has no colon.
pub fn date_marker(line: &str) -> Option<String> {
    if !FECHA_RE.is_match(line) {
        return None;
    }
    let (_, rest) = line.split_once(':')?;
    Some(rest.trim().to_string())
}

#[derive(Debug, PartialEq)]
pub struct Row {
    pub producto: String,
    pub mayorista: String,
    pub amounts: [f64; AMOUNT_COLUMNS],
}

impl Row {
    fn into_record(self, fecha: &str) -> PriceRecord {
        let [minimo, maximo, moda, promedio] = self.amounts;
        PriceRecord {
            producto: self.producto,
            // The bulletins print a single column for both.
            unidad: self.mayorista.clone(),
            mayorista: self.mayorista,
            minimo,
            maximo,
            moda,
            promedio,
            fecha: fecha.to_string(),
        }
    }
}

/// `<producto...> <mayorista> <min> <max> <moda> <promedio>`
pub fn parse_row(line: &str) -> Option<Row> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < MIN_TOKENS {
        return None;
    }

    let split = tokens.len() - AMOUNT_COLUMNS;
    let mut amounts = [0.0; AMOUNT_COLUMNS];
    for (slot, token) in amounts.iter_mut().zip(&tokens[split..]) {
        *slot = parse_amount(token)?;
    }

    let mayorista = tokens[split - 1];
    let producto = tokens[..split - 1].join(" ");
    if producto.trim().is_empty() || producto.to_lowercase().starts_with("producto") {
        return None;
    }

    Some(Row {
        producto,
        mayorista: mayorista.to_string(),
        amounts,
    })
}

/// Decimal with optional thousands grouping or a decimal comma.
pub fn parse_amount(token: &str) -> Option<f64> {
    let normalized = if GROUPED_RE.is_match(token) {
        token.replace(',', "")
    } else if DECIMAL_COMMA_RE.is_match(token) {
        token.replacen(',', ".", 1)
    } else {
        token.replace(',', "")
    };
    let value: f64 = normalized.parse().ok()?;
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

// ── Tests ──
