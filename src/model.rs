use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// An anchor whose visible text carries the attachment marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentLink {
    pub label: String,
    pub url: String,
}

/// A validated PDF, either downloaded this run or found in the local cache.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub seq: usize,
    pub url: String,
    pub label: String,
    pub local_path: PathBuf,
    pub bytes: Vec<u8>,
}

/// One priced row from a bulletin. Field order is the serialized order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub producto: String,
    pub unidad: String,
    pub mayorista: String,
    #[serde(deserialize_with = "amount")]
    pub minimo: f64,
    #[serde(deserialize_with = "amount")]
    pub maximo: f64,
    #[serde(deserialize_with = "amount")]
    pub moda: f64,
    #[serde(deserialize_with = "amount")]
    pub promedio: f64,
    pub fecha: String,
}

/// Exact-duplicate key: every field as text. Amounts use the shortest
/// round-trip form, so `100` and `100.0` both key as `"100.0"`.
pub type RecordKey = [String; 8];

impl PriceRecord {
    pub fn key(&self) -> RecordKey {
        [
            self.producto.clone(),
            self.unidad.clone(),
            self.mayorista.clone(),
            format!("{:?}", self.minimo),
            format!("{:?}", self.maximo),
            format!("{:?}", self.moda),
            format!("{:?}", self.promedio),
            self.fecha.clone(),
        ]
    }
}

// Older cache files stored amounts as strings ("100.0").
fn amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(f64),
        Text(String),
    }

    match Amount::deserialize(deserializer)? {
        Amount::Number(n) => Ok(n),
        Amount::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| serde::de::Error::custom(format!("invalid amount {:?}: {}", s, e))),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn record(minimo: f64) -> PriceRecord {
        PriceRecord {
            producto: "Tomate".into(),
            unidad: "Caja".into(),
            mayorista: "Caja".into(),
            minimo,
            maximo: 150.0,
            moda: 120.5,
            promedio: 130.25,
            fecha: "05/06/2024".into(),
        }
    }

    #[test]
    fn serializes_fields_in_declared_order() {
        let json = serde_json::to_string(&record(100.0)).unwrap();
        let order = ["producto", "unidad", "mayorista", "minimo", "maximo", "moda", "promedio", "fecha"];
        let positions: Vec<usize> = order
            .iter()
            .map(|f| json.find(&format!("\"{}\"", f)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reads_legacy_string_amounts() {
        let json = r#"{"producto":"Chile dulce","unidad":"Saco","mayorista":"Saco",
            "minimo":"100.0","maximo":"150.0","moda":"120.5","promedio":"130.25","fecha":"05/06/2024"}"#;
        let r: PriceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.minimo, 100.0);
        assert_eq!(r.promedio, 130.25);
    }

    #[test]
    fn key_is_textual_and_covers_every_field() {
        let a = record(100.0);
        let b = record(100.0);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key()[3], "100.0");

        let mut c = record(100.0);
        c.fecha = "06/06/2024".into();
        assert_ne!(a.key(), c.key());
    }
}
