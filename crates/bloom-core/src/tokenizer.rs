/// Splits text into character n-grams, the unit stored in chunk blooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NGramTokenizer {
    n: usize,
    skip: usize,
}

impl NGramTokenizer {
    /// `skip` is the number of n-grams dropped between two emitted ones.
    pub fn new(n: usize, skip: usize) -> Self {
        Self { n, skip }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Tokens of `text` in order of appearance, without duplicates.
    ///
    /// Text shorter than `n` produces no tokens and therefore cannot rule out any chunk.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if self.n == 0 || chars.len() < self.n {
            return Vec::new();
        }

        let mut out: Vec<String> = Vec::new();
        for window in chars.windows(self.n).step_by(self.skip + 1) {
            let token: String = window.iter().collect();
            if !out.contains(&token) {
                out.push(token);
            }
        }
        out
    }
}
