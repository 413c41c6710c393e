use async_trait::async_trait;
use reqwest::header::HeaderMap;
use url::Url;

use super::{PlatformType, ResolvedVideo, Resolver};
use crate::errors::PlayerError;

/// Plain http(s) links to `.flv` files.
pub fn test_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.path().to_ascii_lowercase().ends_with(".flv")
        }
        Err(_) => false,
    }
}

pub struct DirectResolver;

#[async_trait]
impl Resolver for DirectResolver {
    fn platform(&self) -> PlatformType {
        PlatformType::Direct
    }

    async fn get_videos(&self, url: &str) -> Result<ResolvedVideo, PlayerError> {
        if !test_url(url) {
            return Err(PlayerError::NoResolver {
                url: url.to_string(),
            });
        }
        Ok(ResolvedVideo {
            platform: PlatformType::Direct,
            urls: vec![url.to_string()],
            duration: None,
            headers: HeaderMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_flv_links_only() {
        assert!(test_url("http://localhost:6060/buggybuf2.flv"));
        assert!(test_url("https://cdn.example/a/B.FLV?token=1"));
        assert!(!test_url("https://cdn.example/a.mp4"));
        assert!(!test_url("ftp://cdn.example/a.flv"));
        assert!(!test_url("a.flv"));
    }

    #[tokio::test]
    async fn resolves_to_itself() {
        let resolved = DirectResolver
            .get_videos("http://localhost:6060/a.flv")
            .await
            .unwrap();
        assert_eq!(resolved.urls, vec!["http://localhost:6060/a.flv".to_string()]);
        assert_eq!(resolved.source().duration, None);
    }
}
