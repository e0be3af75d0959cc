//! Deep-link argument parsing.
//!
//! A host process started as
//!
//! ```text
//! dweb-host dweb install -url=https://x.test/app.json -mode debug
//! ```
//!
//! delivers `dweb://install?url=https%3A%2F%2Fx.test%2Fapp.json&mode=debug`
//! to every module whose manifest declares a `dweb://install` prefix.

use crate::{DwebError, Result};
use url::Url;

/// Normalize `<scheme> <path...> [-key=value | -key value]...` into one URL.
///
/// Path segments are joined with `/`. A flag with neither `=value` nor a
/// following value gets an empty value. A first argument that already is a
/// URL (`scheme://...`) is used as the base.
pub fn normalize_args<S: AsRef<str>>(args: &[S]) -> Result<Url> {
    let mut args = args.iter().map(AsRef::as_ref).peekable();
    let head = args
        .next()
        .filter(|s| !s.is_empty() && !s.starts_with('-'))
        .ok_or_else(|| DwebError::invalid_params("deep link needs a scheme"))?;

    let mut segments: Vec<&str> = Vec::new();
    while let Some(segment) = args.next_if(|s| !s.starts_with('-')) {
        segments.push(segment.trim_matches('/'));
    }

    let base = if head.contains("://") {
        let mut base = head.trim_end_matches('/').to_string();
        for segment in &segments {
            base.push('/');
            base.push_str(segment);
        }
        base
    } else {
        format!("{}://{}", head.trim_end_matches(':'), segments.join("/"))
    };
    let mut url = Url::parse(&base)
        .map_err(|e| DwebError::invalid_params(format!("bad deep link {}: {}", base, e)))?;

    let mut params: Vec<(String, String)> = Vec::new();
    while let Some(arg) = args.next() {
        let flag = arg.trim_start_matches('-');
        if flag.is_empty() {
            continue;
        }
        match flag.split_once('=') {
            Some((key, value)) => params.push((key.to_string(), value.to_string())),
            None => {
                let value = args.next_if(|s| !s.starts_with('-')).unwrap_or("");
                params.push((flag.to_string(), value.to_string()));
            }
        }
    }
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}
