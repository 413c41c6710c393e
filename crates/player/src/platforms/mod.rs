pub mod bilibili;
pub mod direct;

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::errors::PlayerError;
use crate::Source;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlatformType {
    BiliBili,
    Direct,
}

impl PlatformType {
    /// Resolution order, first match wins
    pub const ALL: [PlatformType; 2] = [PlatformType::BiliBili, PlatformType::Direct];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::BiliBili => "bilibili",
            PlatformType::Direct => "direct",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bilibili" => Some(PlatformType::BiliBili),
            "direct" => Some(PlatformType::Direct),
            _ => None,
        }
    }

    fn test_url(&self, url: &str) -> bool {
        match self {
            PlatformType::BiliBili => bilibili::test_url(url),
            PlatformType::Direct => direct::test_url(url),
        }
    }
}

/// What a resolver found behind a page url.
#[derive(Debug, Clone)]
pub struct ResolvedVideo {
    pub platform: PlatformType,
    pub urls: Vec<String>,
    pub duration: Option<f64>,
    /// Headers the media hosts expect, e.g. a referer
    pub headers: HeaderMap,
}

impl ResolvedVideo {
    pub fn source(&self) -> Source {
        Source::new(self.urls.clone(), self.duration)
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    fn platform(&self) -> PlatformType;
    fn test_url(&self, url: &str) -> bool {
        self.platform().test_url(url)
    }
    async fn get_videos(&self, url: &str) -> Result<ResolvedVideo, PlayerError>;
}

/// Platform that handles `url`, if any.
pub fn select_platform(url: &str) -> Option<PlatformType> {
    PlatformType::ALL.into_iter().find(|p| p.test_url(url))
}

pub fn create_resolver(platform: PlatformType) -> Result<Box<dyn Resolver>, PlayerError> {
    Ok(match platform {
        PlatformType::BiliBili => Box::new(bilibili::BiliResolver::new()?),
        PlatformType::Direct => Box::new(direct::DirectResolver),
    })
}

/// Pick the resolver for `url` and ask it for the media locations.
pub async fn resolve(url: &str) -> Result<ResolvedVideo, PlayerError> {
    let platform = select_platform(url).ok_or_else(|| PlayerError::NoResolver {
        url: url.to_string(),
    })?;
    log::info!("Resolve {} with {}", url, platform.as_str());
    let resolved = create_resolver(platform)?.get_videos(url).await?;
    if resolved.urls.is_empty() {
        return Err(PlayerError::NoSources);
    }
    Ok(resolved)
}
