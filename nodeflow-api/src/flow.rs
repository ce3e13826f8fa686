use crate::observer::v1::Http;

impl Http {
    /// Loosely identical: code, method, url and protocol match. Enough
    /// to tell two reports of the same request apart from genuinely
    /// different requests.
    pub fn loose_eq(&self, other: &Http) -> bool {
        self.code == other.code
            && self.method == other.method
            && self.url == other.url
            && self.protocol == other.protocol
    }
}
