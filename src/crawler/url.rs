//! Review listing URLs and continuation tokens
//!
//! The review listing is an async dialog endpoint. One request returns one
//! page of reviews sorted newest first; the page embeds the token for the
//! next page as a `data-next-page-token` attribute.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

use super::fetcher::FetchError;

/// Path of the review dialog on the review host
const REVIEW_DIALOG_PATH: &str = "/async/reviewDialog";

static TOKEN_PATTERN: OnceLock<Regex> = OnceLock::new();

fn token_pattern() -> &'static Regex {
    TOKEN_PATTERN.get_or_init(|| {
        Regex::new(r#"data-next-page-token="(\w+=*)""#).expect("token pattern is valid")
    })
}

/// Build the URL for one review page
///
/// `host_template` may contain `{domain}`, replaced by the job's domain hint
/// (e.g. `https://www.google.{domain}` with `es`). An empty `token` requests
/// the first page of the feed.
pub fn review_url(
    host_template: &str,
    secondary_id: &str,
    token: &str,
    domain: &str,
    locale: &str,
) -> Result<Url, FetchError> {
    let host = host_template.replace("{domain}", domain);
    let mut url = Url::parse(&host).map_err(|e| FetchError::InvalidUrl(format!("{host}: {e}")))?;
    url.set_path(REVIEW_DIALOG_PATH);

    let query = format!(
        "feature_id:{secondary_id},sort_by:newestFirst,next_page_token:{token},associated_topic:,_fmt:pc"
    );
    url.query_pairs_mut()
        .clear()
        .append_pair("hl", locale)
        .append_pair("async", &query);

    Ok(url)
}

/// The continuation token embedded in a page, if it has a well-formed one
pub fn extract_continuation_token(content: &str) -> Option<String> {
    token_pattern()
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_url_first_page() {
        let url = review_url(
            "https://www.google.{domain}",
            "0x12a4:0x9f",
            "",
            "es",
            "es",
        )
        .unwrap();

        assert_eq!(url.host_str(), Some("www.google.es"));
        assert_eq!(url.path(), "/async/reviewDialog");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("hl".to_string(), "es".to_string()));
        assert_eq!(
            pairs[1].1,
            "feature_id:0x12a4:0x9f,sort_by:newestFirst,next_page_token:,associated_topic:,_fmt:pc"
        );
    }

    #[test]
    fn test_review_url_with_token() {
        let url = review_url("http://127.0.0.1:8080", "abc", "CAESBkVnSUlDZw==", "com", "en").unwrap();
        let query = url
            .query_pairs()
            .find(|(k, _)| k == "async")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert!(query.contains("next_page_token:CAESBkVnSUlDZw==,"));
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn test_review_url_invalid_host() {
        let err = review_url("not a url", "abc", "", "es", "es").unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[test]
    fn test_extract_token() {
        let page = r#"<div class="gws-localreviews__general-reviews-block" data-next-page-token="CAESBkVnSUlDZw=="></div>"#;
        assert_eq!(
            extract_continuation_token(page).as_deref(),
            Some("CAESBkVnSUlDZw==")
        );
    }

    #[test]
    fn test_extract_token_without_padding() {
        let page = r#"<div data-next-page-token="abc"></div>"#;
        assert_eq!(extract_continuation_token(page).as_deref(), Some("abc"));
    }

    #[test]
    fn test_missing_or_empty_token() {
        assert!(extract_continuation_token("<div></div>").is_none());
        assert!(extract_continuation_token(r#"<div data-next-page-token=""></div>"#).is_none());
        assert!(extract_continuation_token(r#"<div data-next-page-token="a b"></div>"#).is_none());
    }
}
