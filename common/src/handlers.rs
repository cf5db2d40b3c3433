//! Handlers de análisis: funciones puras `(tipo, params, secciones) -> payload`.
//!
//! Un worker llama a `handle` una sola vez por lote, con las secciones ya
//! ordenadas por id.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::error::AnalysisError;
use crate::kind::AnalysisKind;
use crate::message::{Params, Payload, ToneTally, WordFreq};
use crate::text::{count_words, extract_words, split_sentences};

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "wonderful", "amazing", "fantastic", "beautiful", "happy", "joy",
    "love", "like", "best", "better", "perfect", "brilliant", "positive", "success", "win",
    "victory", "hope", "bright", "cheerful", "delight", "pleasure", "enjoy", "satisfaction",
    "pleased", "glad", "nice",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "horrible", "worst", "hate", "dislike", "sad", "angry", "fear",
    "worry", "problem", "difficult", "hard", "negative", "failure", "lose", "defeat", "despair",
    "dark", "gloomy", "pain", "suffering", "disappointment", "disgust", "horror", "evil", "wrong",
];

fn positive_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| POSITIVE_WORDS.iter().copied().collect())
}

fn negative_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| NEGATIVE_WORDS.iter().copied().collect())
}

/// Ejecuta el análisis `kind` sobre las secciones de un lote.
pub fn handle(
    kind: AnalysisKind,
    params: &Params,
    sections: &[String],
) -> Result<Payload, AnalysisError> {
    let payload = match kind {
        AnalysisKind::WordCount => {
            Payload::WordCount(sections.iter().map(|s| count_words(s)).sum())
        }
        AnalysisKind::TopNWords => Payload::TopWords(top_n_words(sections, params.n)),
        AnalysisKind::Tonality => Payload::Tonality(tonality(sections)),
        AnalysisKind::SortSentences => Payload::Sentences(
            sections.iter().flat_map(|s| split_sentences(s)).collect(),
        ),
        AnalysisKind::ReplaceText => Payload::Text(replace_text(sections, params)),
        AnalysisKind::Unknown => return Err(AnalysisError::UnknownKind),
    };
    Ok(payload)
}

fn top_n_words(sections: &[String], n: Option<i64>) -> Vec<WordFreq> {
    let limit = match n {
        Some(n) if n > 0 => n as usize,
        _ => return Vec::new(),
    };

    let mut counts: HashMap<String, u64> = HashMap::new();
    for section in sections {
        for word in extract_words(section) {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    rank_words(counts, limit)
}

/// Ordena por conteo descendente y, en empate, por palabra ascendente;
/// luego corta en `limit`. El orden es total, así que el resultado no
/// depende del orden de iteración del mapa.
pub fn rank_words(counts: HashMap<String, u64>, limit: usize) -> Vec<WordFreq> {
    let mut ranked: Vec<WordFreq> = counts
        .into_iter()
        .map(|(word, count)| WordFreq { count, word })
        .collect();

    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    ranked.truncate(limit);
    ranked
}

fn tonality(sections: &[String]) -> ToneTally {
    let positive = positive_words();
    let negative = negative_words();
    let mut tally = ToneTally::default();

    for section in sections {
        for word in extract_words(section) {
            if positive.contains(word.as_str()) {
                tally.positive += 1;
            } else if negative.contains(word.as_str()) {
                tally.negative += 1;
            }
        }
    }

    tally
}

fn replace_text(sections: &[String], params: &Params) -> String {
    match &params.replace {
        Some(r) if !r.from.is_empty() => sections
            .iter()
            .map(|s| s.replace(r.from.as_str(), r.to.as_str()))
            .collect(),
        _ => sections.concat(),
    }
}
