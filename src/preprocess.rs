/// Characters that get detached from the surrounding words.
const DETACHED_PUNCTUATION: [char; 5] = ['?', '.', '!', ',', '¿'];

/// Normalizes a raw sentence: optional lowercasing, punctuation split off
/// into its own word, double quotes dropped, whitespace collapsed to single
/// spaces.
pub fn preprocess(sentence: &str, lower: bool) -> String {
    let sentence = if lower {
        sentence.to_lowercase()
    } else {
        sentence.to_string()
    };

    let mut spaced = String::with_capacity(sentence.len() + 8);
    for c in sentence.chars() {
        if DETACHED_PUNCTUATION.contains(&c) {
            spaced.push(' ');
            spaced.push(c);
            spaced.push(' ');
        } else if c == '"' {
            spaced.push(' ');
        } else {
            spaced.push(c);
        }
    }

    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}
