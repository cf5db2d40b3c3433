use std::{convert::Infallible, fmt, str::FromStr};

/// Tipo de análisis pedido para un texto.
///
/// Es un conjunto cerrado: handler, reducer y codec hacen `match` exhaustivo
/// sobre este enum, así que agregar un tipo obliga a tocar los tres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AnalysisKind {
    WordCount,
    TopNWords,
    Tonality,
    SortSentences,
    ReplaceText,
    /// Cualquier `type` que no reconocemos. Nunca tiene handler ni reducer.
    #[default]
    Unknown,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 5] = [
        AnalysisKind::WordCount,
        AnalysisKind::TopNWords,
        AnalysisKind::Tonality,
        AnalysisKind::SortSentences,
        AnalysisKind::ReplaceText,
    ];

    /// Nombre en el protocolo (campo `type`).
    pub fn as_wire(&self) -> &'static str {
        match self {
            AnalysisKind::WordCount => "words_count",
            AnalysisKind::TopNWords => "top_n",
            AnalysisKind::Tonality => "tonality",
            AnalysisKind::SortSentences => "sort_sentences",
            AnalysisKind::ReplaceText => "replace_text",
            AnalysisKind::Unknown => "unknown",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "words_count" => AnalysisKind::WordCount,
            "top_n" => AnalysisKind::TopNWords,
            "tonality" => AnalysisKind::Tonality,
            "sort_sentences" => AnalysisKind::SortSentences,
            "replace_text" => AnalysisKind::ReplaceText,
            _ => AnalysisKind::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, AnalysisKind::Unknown)
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Nunca falla: lo que no se reconoce es `Unknown`. Lo usa clap para `--kind`.
impl FromStr for AnalysisKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AnalysisKind::from_wire(s.trim()))
    }
}
