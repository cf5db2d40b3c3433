use crate::message::Sentence;

/// Cuenta corridas maximales de caracteres que no son espacio ni de control.
pub fn count_words(text: &str) -> u64 {
    let mut count = 0;
    let mut in_word = false;

    for c in text.chars() {
        if c.is_whitespace() || c.is_control() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            count += 1;
        }
    }

    count
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '-'
}

fn is_joiner(c: char) -> bool {
    c == '\'' || c == '-'
}

/// Tokeniza en palabras alfanuméricas en minúscula.
/// Apóstrofe y guión cuentan sólo dentro de la palabra ("it's", "well-known").
pub fn extract_words(text: &str) -> Vec<String> {
    text.split(|c: char| !is_word_char(c))
        .map(|raw| raw.trim_matches(is_joiner))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Corta en oraciones en `.`, `!` o `?` cuando sigue fin de texto, un espacio,
/// o una mayúscula dos caracteres más adelante. Heurística, no gramática.
pub fn split_sentences(text: &str) -> Vec<Sentence> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0;

    for (i, &c) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }

        let at_end = i + 1 >= chars.len();
        let space_next = chars.get(i + 1).is_some_and(|n| n.is_whitespace());
        let upper_ahead = chars.get(i + 2).is_some_and(|n| n.is_uppercase());

        if at_end || space_next || upper_ahead {
            push_sentence(&mut out, &chars[start..=i]);
            start = i + 1;
        }
    }

    if start < chars.len() {
        push_sentence(&mut out, &chars[start..]);
    }

    out
}

fn push_sentence(out: &mut Vec<Sentence>, chars: &[char]) {
    let raw: String = chars.iter().collect();
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        out.push(Sentence {
            length: trimmed.chars().count() as u64,
            text: trimmed.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_words_cuenta_corridas_sin_espacios() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("   \n\t "), 0);
        assert_eq!(count_words("Hola, mundo!"), 2);
        assert_eq!(count_words("  uno\tdos\r\ntres  "), 3);
        assert_eq!(count_words("a\u{0007}b"), 2);
        assert_eq!(count_words("año ñandú"), 2);
    }

    #[test]
    fn extract_words_normaliza_y_respeta_apostrofes() {
        assert_eq!(
            extract_words("It's a WELL-known fact -- 'quoted' words, 42 times!"),
            vec!["it's", "a", "well-known", "fact", "quoted", "words", "42", "times"]
        );
        assert!(extract_words("... -- ''").is_empty());
    }

    #[test]
    fn split_sentences_corta_en_puntuacion() {
        let s = split_sentences("Hola mundo. ¿Qué tal?Bien!  Fin sin punto");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["Hola mundo.", "¿Qué tal?Bien!", "Fin sin punto"]);
        assert_eq!(s[0].length, 11);
    }

    #[test]
    fn split_sentences_mayuscula_dos_adelante() {
        let s = split_sentences("Dijo.\"Vamos\" y se fue.");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["Dijo.", "\"Vamos\" y se fue."]);
    }

    #[test]
    fn split_sentences_descarta_vacias() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   ").is_empty());
        let s = split_sentences("Uno. . Dos.");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["Uno.", ".", "Dos."]);
    }
}
