//! Tokenization, stopwords and the small lexicons the pattern detector
//! classifies with.

use std::collections::{HashMap, HashSet};

pub const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as",
    "at", "be", "because", "been", "before", "being", "below", "between", "both", "but", "by",
    "can", "could", "did", "do", "does", "doing", "don", "down", "during", "each", "even", "few",
    "for", "from", "further", "get", "got", "had", "has", "have", "having", "he", "her", "here",
    "hers", "herself", "him", "himself", "his", "how", "i", "if", "im", "in", "into", "is", "it",
    "its", "itself", "just", "like", "me", "more", "most", "much", "my", "myself", "no", "nor",
    "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "ours", "ourselves",
    "out", "over", "own", "really", "same", "she", "should", "so", "some", "still", "such",
    "than", "that", "the", "their", "theirs", "them", "themselves", "then", "there", "these",
    "they", "thing", "things", "this", "those", "through", "to", "today", "too", "under", "until",
    "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "would", "you", "your", "yours", "yourself", "yourselves",
];

/// Words that mark an entry as emotionally loaded.
pub const MOOD_WORDS: &[&str] = &[
    "afraid", "angry", "annoyed", "anxiety", "anxious", "ashamed", "calm", "cheerful", "content",
    "depressed", "disappointed", "dread", "excited", "exhausted", "frustrated", "frustration",
    "glad", "grateful", "grief", "guilty", "happy", "hopeful", "hopeless", "irritated", "joy",
    "lonely", "miserable", "nervous", "overwhelmed", "panic", "peaceful", "proud", "relieved",
    "sad", "scared", "stressed", "stress", "tense", "thrilled", "tired", "upset", "worried",
    "worry",
];

/// Words that mark a habitual, repeated activity.
pub const HABIT_WORDS: &[&str] = &[
    "always", "daily", "every", "everyday", "habit", "often", "ritual", "routine", "usually",
    "weekly", "nightly",
];

fn contains(list: &[&str], word: &str) -> bool {
    list.contains(&word)
}

/// Lowercased alphanumeric words of at least two characters. Apostrophes are
/// dropped so "I'm" becomes "im".
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.replace('\'', "").to_lowercase())
        .filter(|w| w.chars().count() >= 2)
        .collect()
}

/// [`words`] without stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .filter(|w| !contains(STOPWORDS, w))
        .collect()
}

pub fn is_mood_word(word: &str) -> bool {
    contains(MOOD_WORDS, word)
}

pub fn has_mood_language(text: &str) -> bool {
    words(text).iter().any(|w| is_mood_word(w))
}

pub fn has_habit_language(text: &str) -> bool {
    words(text).iter().any(|w| contains(HABIT_WORDS, w))
}

/// Up to `max` tokens ranked by how many of `documents` contain them; ties
/// go to the higher total count, then alphabetically. Tokens seen in a single
/// document are dropped when the set has more than one document.
pub fn top_keywords<S: AsRef<str>>(documents: &[S], max: usize) -> Vec<String> {
    let mut doc_freq: HashMap<String, usize> = HashMap::new();
    let mut total: HashMap<String, usize> = HashMap::new();
    for doc in documents {
        let tokens = tokenize(doc.as_ref());
        let unique: HashSet<&String> = tokens.iter().collect();
        for t in unique {
            *doc_freq.entry(t.clone()).or_default() += 1;
        }
        for t in tokens {
            *total.entry(t).or_default() += 1;
        }
    }

    let min_df = if documents.len() > 1 { 2 } else { 1 };
    let mut ranked: Vec<(String, usize)> = doc_freq
        .into_iter()
        .filter(|(_, df)| *df >= min_df)
        .collect();
    ranked.sort_by(|(a, da), (b, db)| {
        db.cmp(da)
            .then_with(|| total[b].cmp(&total[a]))
            .then_with(|| a.cmp(b))
    });
    ranked.into_iter().take(max).map(|(w, _)| w).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_stopwords_and_punctuation() {
        assert_eq!(
            tokenize("What did I write about my dog? I'm sure it's Rex."),
            vec!["write", "dog", "sure", "rex"]
        );
    }

    #[test]
    fn lexicons_match_whole_words() {
        assert!(has_mood_language("Felt anxious before the call"));
        assert!(!has_mood_language("Cleaned the garage"));
        assert!(has_habit_language("My usual routine: coffee then emails"));
        assert!(!has_habit_language("A one-off trip to the coast"));
    }

    #[test]
    fn top_keywords_ranks_by_document_frequency() {
        let docs = [
            "job interview tomorrow, nervous about the interview",
            "another job interview, hands shaking",
            "interview went fine, job offer maybe",
        ];
        let kw = top_keywords(&docs, 3);
        assert_eq!(kw[0], "interview");
        assert_eq!(kw[1], "job");
        assert_eq!(kw.len(), 2, "single-document tokens are dropped");
    }
}
