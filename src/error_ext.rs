use std::error::Error as StdError;

/// Adds chain-formatting helpers to any `std::error::Error`, mirroring the
/// `talpid_types::ErrorExt` trait this crate's callers reach for when logging.
pub trait ErrorExt {
    /// Formats the error together with its full `source()` chain.
    fn display_chain(&self) -> String;

    /// Same as [`ErrorExt::display_chain`] but prefixed with a short message.
    fn display_chain_with_msg(&self, msg: &str) -> String;
}

impl<E: StdError> ErrorExt for E {
    fn display_chain(&self) -> String {
        let mut chain = self.to_string();
        let mut source = self.source();
        while let Some(error) = source {
            chain.push_str("\nCaused by: ");
            chain.push_str(&error.to_string());
            source = error.source();
        }
        chain
    }

    fn display_chain_with_msg(&self, msg: &str) -> String {
        format!("{}\n{}", msg, self.display_chain())
    }
}
