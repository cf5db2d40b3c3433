//! Protocolo de mensajes entre splitter, workers y aggregator.
//!
//! Los mensajes viajan como objetos JSON. La decodificación es tolerante:
//! campos faltantes o con tipo incorrecto quedan en cero/vacío y un `type`
//! desconocido se convierte en `AnalysisKind::Unknown`. Sólo falla si el
//! texto no es un objeto JSON.

use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::DecodeError;
use crate::kind::AnalysisKind;

pub type TaskId = u64;
pub type SectionId = u64;

/// Reemplazo literal para `replace_text`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

/// Parámetros opcionales de una tarea.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params {
    /// `N` de top_n.
    pub n: Option<i64>,
    pub replace: Option<Replacement>,
}

/// Un lote: splitter -> cola de trabajo -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub kind: AnalysisKind,
    pub section_ids: Vec<SectionId>,
    pub total_sections: u64,
    pub params: Params,
    /// Posición del lote dentro de la tarea (0, 1, 2...).
    pub batch_index: Option<u32>,
    /// Momento de creación de la tarea, en ms desde epoch.
    pub start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordFreq {
    pub count: u64,
    pub word: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub length: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToneTally {
    pub positive: u64,
    pub negative: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Positive,
    Negative,
    Neutral,
}

impl ToneTally {
    /// `positive` si pos > neg * 1.2, `negative` si neg > pos * 1.2.
    /// Se compara en enteros (5·a > 6·b) para no depender de flotantes.
    pub fn verdict(&self) -> Verdict {
        let pos = u128::from(self.positive);
        let neg = u128::from(self.negative);
        if pos * 5 > neg * 6 {
            Verdict::Positive
        } else if neg * 5 > pos * 6 {
            Verdict::Negative
        } else {
            Verdict::Neutral
        }
    }
}

/// Forma de protocolo: "neutral (positive: 12, negative: 10)".
impl fmt::Display for ToneTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (positive: {}, negative: {})",
            self.verdict(),
            self.positive,
            self.negative
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Positive => "positive",
            Verdict::Negative => "negative",
            Verdict::Neutral => "neutral",
        };
        f.write_str(s)
    }
}

/// Resultado propio de cada tipo de análisis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    WordCount(u64),
    TopWords(Vec<WordFreq>),
    Tonality(ToneTally),
    Sentences(Vec<Sentence>),
    Text(String),
    /// Sólo para `Unknown`.
    Empty,
}

impl Payload {
    /// Payload vacío del tipo pedido.
    pub fn empty_for(kind: AnalysisKind) -> Self {
        match kind {
            AnalysisKind::WordCount => Payload::WordCount(0),
            AnalysisKind::TopNWords => Payload::TopWords(Vec::new()),
            AnalysisKind::Tonality => Payload::Tonality(ToneTally::default()),
            AnalysisKind::SortSentences => Payload::Sentences(Vec::new()),
            AnalysisKind::ReplaceText => Payload::Text(String::new()),
            AnalysisKind::Unknown => Payload::Empty,
        }
    }
}

/// Resultado parcial (worker -> aggregator) o agregado (aggregator -> sink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub task_id: TaskId,
    pub kind: AnalysisKind,
    pub sections_count: u64,
    pub total_sections: u64,
    pub params: Params,
    pub batch_index: Option<u32>,
    pub start_time: i64,
    pub payload: Payload,
}

/* ---------------- encode ---------------- */

impl TaskMessage {
    pub fn to_json(&self) -> String {
        let mut obj = Map::new();
        obj.insert("task_id".into(), json!(self.task_id));
        obj.insert("type".into(), json!(self.kind.as_wire()));
        obj.insert("section_ids".into(), json!(self.section_ids));
        obj.insert("total_sections".into(), json!(self.total_sections));
        obj.insert("start_time".into(), json!(self.start_time));
        if let Some(idx) = self.batch_index {
            obj.insert("batch_index".into(), json!(idx));
        }
        encode_params(&mut obj, &self.params);
        Value::Object(obj).to_string()
    }

    pub fn from_json(msg: &str) -> Result<Self, DecodeError> {
        let obj = parse_object(msg)?;
        Ok(Self {
            task_id: get_u64(&obj, "task_id"),
            kind: get_kind(&obj),
            section_ids: obj
                .get("section_ids")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default(),
            total_sections: get_u64(&obj, "total_sections"),
            params: decode_params(&obj),
            batch_index: get_batch_index(&obj),
            start_time: get_i64(&obj, "start_time"),
        })
    }
}

impl ResultMessage {
    pub fn to_json(&self) -> String {
        let mut obj = Map::new();
        obj.insert("task_id".into(), json!(self.task_id));
        obj.insert("type".into(), json!(self.kind.as_wire()));
        obj.insert("sections_count".into(), json!(self.sections_count));
        obj.insert("total_sections".into(), json!(self.total_sections));
        obj.insert("start_time".into(), json!(self.start_time));
        if let Some(idx) = self.batch_index {
            obj.insert("batch_index".into(), json!(idx));
        }
        encode_params(&mut obj, &self.params);
        obj.insert("result".into(), encode_payload(&self.payload));
        Value::Object(obj).to_string()
    }

    pub fn from_json(msg: &str) -> Result<Self, DecodeError> {
        let obj = parse_object(msg)?;
        let kind = get_kind(&obj);
        Ok(Self {
            task_id: get_u64(&obj, "task_id"),
            kind,
            sections_count: get_u64(&obj, "sections_count"),
            total_sections: get_u64(&obj, "total_sections"),
            params: decode_params(&obj),
            batch_index: get_batch_index(&obj),
            start_time: get_i64(&obj, "start_time"),
            payload: decode_payload(kind, obj.get("result")),
        })
    }
}

fn encode_params(obj: &mut Map<String, Value>, params: &Params) {
    if let Some(n) = params.n {
        obj.insert("n".into(), json!(n));
    }
    if let Some(r) = &params.replace {
        obj.insert("replace".into(), json!({ "from": r.from, "to": r.to }));
    }
}

fn encode_payload(payload: &Payload) -> Value {
    match payload {
        Payload::WordCount(n) => json!(n),
        Payload::TopWords(words) => Value::Array(
            words
                .iter()
                .map(|w| json!({ "word": w.word, "count": w.count }))
                .collect(),
        ),
        Payload::Tonality(t) => json!(t.to_string()),
        Payload::Sentences(sentences) => Value::Array(
            sentences
                .iter()
                .map(|s| json!({ "sentence": s.text, "length": s.length }))
                .collect(),
        ),
        Payload::Text(text) => json!(text),
        Payload::Empty => Value::Null,
    }
}

/* ---------------- decode ---------------- */

fn parse_object(msg: &str) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_str::<Value>(msg)? {
        Value::Object(obj) => Ok(obj),
        _ => Err(DecodeError::NotAnObject),
    }
}

fn get_u64(obj: &Map<String, Value>, key: &str) -> u64 {
    obj.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn get_i64(obj: &Map<String, Value>, key: &str) -> i64 {
    obj.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn get_str<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a str {
    obj.get(key).and_then(Value::as_str).unwrap_or("")
}

fn get_kind(obj: &Map<String, Value>) -> AnalysisKind {
    obj.get("type")
        .and_then(Value::as_str)
        .map(AnalysisKind::from_wire)
        .unwrap_or(AnalysisKind::Unknown)
}

fn get_batch_index(obj: &Map<String, Value>) -> Option<u32> {
    obj.get("batch_index")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

fn decode_params(obj: &Map<String, Value>) -> Params {
    let replace = obj
        .get("replace")
        .and_then(Value::as_object)
        .map(|r| Replacement {
            from: get_str(r, "from").to_string(),
            to: get_str(r, "to").to_string(),
        });

    Params {
        n: obj.get("n").and_then(Value::as_i64),
        replace,
    }
}

fn decode_payload(kind: AnalysisKind, value: Option<&Value>) -> Payload {
    let Some(value) = value else {
        return Payload::empty_for(kind);
    };

    match kind {
        AnalysisKind::WordCount => Payload::WordCount(value.as_u64().unwrap_or(0)),
        AnalysisKind::TopNWords => Payload::TopWords(
            value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_object)
                        .map(|o| WordFreq {
                            count: get_u64(o, "count"),
                            word: get_str(o, "word").to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        ),
        AnalysisKind::Tonality => Payload::Tonality(match value {
            Value::Object(o) => ToneTally {
                positive: get_u64(o, "positive"),
                negative: get_u64(o, "negative"),
            },
            Value::String(s) => parse_tonality(s),
            _ => ToneTally::default(),
        }),
        AnalysisKind::SortSentences => Payload::Sentences(
            value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_object)
                        .map(|o| Sentence {
                            length: get_u64(o, "length"),
                            text: get_str(o, "sentence").to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        ),
        AnalysisKind::ReplaceText => Payload::Text(value.as_str().unwrap_or("").to_string()),
        AnalysisKind::Unknown => Payload::Empty,
    }
}

/// Inversa del `Display` de `ToneTally`; el veredicto se recalcula.
fn parse_tonality(s: &str) -> ToneTally {
    ToneTally {
        positive: number_after(s, "positive: "),
        negative: number_after(s, "negative: "),
    }
}

fn number_after(s: &str, label: &str) -> u64 {
    let Some(pos) = s.find(label) else {
        return 0;
    };
    let digits: String = s[pos + label.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(kind: AnalysisKind, payload: Payload) -> ResultMessage {
        ResultMessage {
            task_id: 17,
            kind,
            sections_count: 10,
            total_sections: 42,
            params: Params {
                n: Some(5),
                replace: None,
            },
            batch_index: Some(3),
            start_time: 1_700_000_000_123,
            payload,
        }
    }

    #[test]
    fn result_message_ida_y_vuelta_para_cada_tipo() {
        let tricky = "dijo \"hola\"\\ adiós\nfin\t✓";
        let cases = vec![
            result_with(AnalysisKind::WordCount, Payload::WordCount(1234)),
            result_with(
                AnalysisKind::TopNWords,
                Payload::TopWords(vec![
                    WordFreq { count: 9, word: tricky.to_string() },
                    WordFreq { count: 2, word: "it's".to_string() },
                ]),
            ),
            result_with(
                AnalysisKind::Tonality,
                Payload::Tonality(ToneTally { positive: 13, negative: 10 }),
            ),
            result_with(
                AnalysisKind::SortSentences,
                Payload::Sentences(vec![Sentence {
                    length: tricky.chars().count() as u64,
                    text: tricky.to_string(),
                }]),
            ),
            {
                let mut r = result_with(AnalysisKind::ReplaceText, Payload::Text(tricky.into()));
                r.params.replace = Some(Replacement {
                    from: "\"a\"".into(),
                    to: "\\b\n".into(),
                });
                r
            },
        ];

        for msg in cases {
            let decoded = ResultMessage::from_json(&msg.to_json()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn tonality_viaja_como_string() {
        let msg = result_with(
            AnalysisKind::Tonality,
            Payload::Tonality(ToneTally { positive: 13, negative: 10 }),
        );
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(
            value["result"],
            json!("positive (positive: 13, negative: 10)")
        );
    }

    #[test]
    fn task_message_ida_y_vuelta() {
        let task = TaskMessage {
            task_id: 3,
            kind: AnalysisKind::TopNWords,
            section_ids: vec![21, 22, 23],
            total_sections: 23,
            params: Params { n: Some(10), replace: None },
            batch_index: Some(2),
            start_time: 99,
        };
        assert_eq!(TaskMessage::from_json(&task.to_json()).unwrap(), task);
    }

    #[test]
    fn campos_faltantes_quedan_en_cero() {
        let task = TaskMessage::from_json(r#"{"type":"tonality"}"#).unwrap();
        assert_eq!(task.task_id, 0);
        assert_eq!(task.kind, AnalysisKind::Tonality);
        assert!(task.section_ids.is_empty());
        assert_eq!(task.total_sections, 0);
        assert_eq!(task.params, Params::default());
        assert_eq!(task.batch_index, None);

        let res = ResultMessage::from_json(r#"{"task_id":"siete","type":"top_n"}"#).unwrap();
        assert_eq!(res.task_id, 0);
        assert_eq!(res.payload, Payload::TopWords(vec![]));
    }

    #[test]
    fn tipo_desconocido_no_rompe_el_decode() {
        let res =
            ResultMessage::from_json(r#"{"task_id":5,"type":"summarize","result":[1,2]}"#).unwrap();
        assert_eq!(res.kind, AnalysisKind::Unknown);
        assert_eq!(res.payload, Payload::Empty);

        let task = TaskMessage::from_json(r#"{"task_id":5,"type":7}"#).unwrap();
        assert_eq!(task.kind, AnalysisKind::Unknown);
    }

    #[test]
    fn json_invalido_o_no_objeto_es_error() {
        assert!(TaskMessage::from_json("no soy json").is_err());
        assert!(matches!(
            ResultMessage::from_json("[1,2,3]"),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn tonality_acepta_string_y_objeto() {
        let res = ResultMessage::from_json(
            r#"{"task_id":1,"type":"tonality","result":"neutral (positive: 12, negative: 10)"}"#,
        )
        .unwrap();
        assert_eq!(
            res.payload,
            Payload::Tonality(ToneTally { positive: 12, negative: 10 })
        );

        let res = ResultMessage::from_json(
            r#"{"task_id":1,"type":"tonality","result":{"positive":2,"negative":5}}"#,
        )
        .unwrap();
        assert_eq!(
            res.payload,
            Payload::Tonality(ToneTally { positive: 2, negative: 5 })
        );
    }

    #[test]
    fn verdict_usa_factor_1_2_estricto() {
        let t = |positive, negative| ToneTally { positive, negative }.verdict();
        assert_eq!(t(12, 10), Verdict::Neutral);
        assert_eq!(t(13, 10), Verdict::Positive);
        assert_eq!(t(10, 13), Verdict::Negative);
        assert_eq!(t(0, 0), Verdict::Neutral);
        assert_eq!(t(1, 0), Verdict::Positive);
    }
}
