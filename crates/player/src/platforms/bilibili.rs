use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use url::Url;

use super::{PlatformType, ResolvedVideo, Resolver};
use crate::errors::PlayerError;
use crate::utils::user_agent_generator::UserAgentGenerator;

const REFERER_URL: &str = "https://www.bilibili.com/";
/// Quality requested from playurl, 80 is 1080p for most uploads
const QUALITY: u32 = 80;

static BV_PATH: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^/video/(BV[0-9A-Za-z]{10})"));
static AV_PATH: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^/video/av(\d+)"));
static LEGACY_PAGE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"/index_(\d+)\.html$"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoId {
    Bvid(String),
    Aid(u64),
}

impl VideoId {
    fn query(&self) -> String {
        match self {
            VideoId::Bvid(bvid) => format!("bvid={bvid}"),
            VideoId::Aid(aid) => format!("aid={aid}"),
        }
    }
}

/// Video page: id plus the 1-based part number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPage {
    pub id: VideoId,
    pub page: usize,
}

/// Parse `bilibili.com/video/BV...` and legacy `/video/av.../index_N.html`
/// page urls.
pub fn parse_video_url(url: &str) -> Option<VideoPage> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if host != "bilibili.com" && !host.ends_with(".bilibili.com") {
        return None;
    }
    let path = parsed.path();

    let bv = BV_PATH.as_ref().ok()?;
    let av = AV_PATH.as_ref().ok()?;
    let id = if let Some(caps) = bv.captures(path) {
        VideoId::Bvid(caps[1].to_string())
    } else {
        let caps = av.captures(path)?;
        VideoId::Aid(caps[1].parse().ok()?)
    };

    let legacy_page = LEGACY_PAGE.as_ref().ok()?;
    let page = parsed
        .query_pairs()
        .find(|(k, _)| k == "p")
        .and_then(|(_, v)| v.parse().ok())
        .or_else(|| {
            legacy_page
                .captures(path)
                .and_then(|caps| caps[1].parse().ok())
        })
        .unwrap_or(1usize)
        .max(1);
    Some(VideoPage { id, page })
}

pub fn test_url(url: &str) -> bool {
    parse_video_url(url).is_some()
}

fn check_code(res: &Value) -> Result<(), PlayerError> {
    let code = res["code"]
        .as_i64()
        .ok_or(PlayerError::InvalidResponseJson { resp: res.clone() })?;
    if code != 0 {
        return Err(PlayerError::ApiError {
            error: format!(
                "code {}: {}",
                code,
                res["message"].as_str().unwrap_or_default()
            ),
        });
    }
    Ok(())
}

/// `cid` of the requested part from a `view` response.
fn parse_view(res: &Value, page: usize) -> Result<u64, PlayerError> {
    check_code(res)?;
    let pages = res["data"]["pages"]
        .as_array()
        .ok_or(PlayerError::InvalidResponseJson { resp: res.clone() })?;
    let part = pages.get(page - 1).or_else(|| pages.first());
    match part.and_then(|p| p["cid"].as_u64()) {
        Some(cid) => Ok(cid),
        None => res["data"]["cid"]
            .as_u64()
            .ok_or(PlayerError::InvalidResponseJson { resp: res.clone() }),
    }
}

/// FLV part urls and total duration from a `playurl` response.
fn parse_playurl(res: &Value) -> Result<(Vec<String>, Option<f64>), PlayerError> {
    check_code(res)?;
    let data = &res["data"];
    let durl = data["durl"]
        .as_array()
        .ok_or(PlayerError::InvalidResponseJson { resp: res.clone() })?;
    let mut parts: Vec<(u64, String)> = durl
        .iter()
        .filter_map(|part| {
            let url = part["url"].as_str()?.to_string();
            Some((part["order"].as_u64().unwrap_or(0), url))
        })
        .collect();
    if parts.is_empty() {
        return Err(PlayerError::InvalidResponse);
    }
    parts.sort_by_key(|(order, _)| *order);
    let duration = data["timelength"]
        .as_f64()
        .filter(|ms| *ms > 0.0)
        .map(|ms| ms / 1000.0);
    Ok((parts.into_iter().map(|(_, url)| url).collect(), duration))
}

pub struct BiliResolver {
    client: Client,
}

impl BiliResolver {
    pub fn new() -> Result<Self, PlayerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PlayerError::ApiError {
                error: e.to_string(),
            })?;
        Ok(Self { client })
    }

    fn generate_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let user_agent = UserAgentGenerator::new().generate();
        if let Ok(value) = HeaderValue::from_str(&user_agent) {
            headers.insert(USER_AGENT, value);
        }
        headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
        headers
    }

    async fn get_json(&self, url: &str, headers: &HeaderMap) -> Result<Value, PlayerError> {
        let response = self.client.get(url).headers(headers.clone()).send().await?;
        if !response.status().is_success() {
            return Err(PlayerError::Network(crate::errors::NetworkError::Status {
                status: response.status().as_u16(),
            }));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Resolver for BiliResolver {
    fn platform(&self) -> PlatformType {
        PlatformType::BiliBili
    }

    async fn get_videos(&self, url: &str) -> Result<ResolvedVideo, PlayerError> {
        let page = parse_video_url(url).ok_or_else(|| PlayerError::NoResolver {
            url: url.to_string(),
        })?;
        let headers = self.generate_headers();

        let view = self
            .get_json(
                &format!(
                    "https://api.bilibili.com/x/web-interface/view?{}",
                    page.id.query()
                ),
                &headers,
            )
            .await?;
        let cid = parse_view(&view, page.page)?;
        log::debug!("Video {:?} part {} has cid {}", page.id, page.page, cid);

        let playurl = self
            .get_json(
                &format!(
                    "https://api.bilibili.com/x/player/playurl?{}&cid={}&qn={}&fnval=0&fourk=1",
                    page.id.query(),
                    cid,
                    QUALITY
                ),
                &headers,
            )
            .await?;
        let (urls, duration) = parse_playurl(&playurl)?;
        log::info!(
            "Resolved {} into {} part(s), duration {:?}",
            url,
            urls.len(),
            duration
        );

        Ok(ResolvedVideo {
            platform: PlatformType::BiliBili,
            urls,
            duration,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_video_page_urls() {
        assert_eq!(
            parse_video_url("https://www.bilibili.com/video/BV1xx411c7mD?p=3"),
            Some(VideoPage {
                id: VideoId::Bvid("BV1xx411c7mD".to_string()),
                page: 3
            })
        );
        assert_eq!(
            parse_video_url("http://www.bilibili.com/video/av3659561/index_57.html"),
            Some(VideoPage {
                id: VideoId::Aid(3659561),
                page: 57
            })
        );
        assert_eq!(
            parse_video_url("http://www.bilibili.com/video/av1753789/"),
            Some(VideoPage {
                id: VideoId::Aid(1753789),
                page: 1
            })
        );
        assert_eq!(parse_video_url("https://live.bilibili.com/12345"), None);
        assert_eq!(parse_video_url("https://notbilibili.com/video/av1"), None);
    }

    #[test]
    fn view_selects_part_cid() {
        let res = json!({
            "code": 0,
            "data": {
                "cid": 100,
                "pages": [{"cid": 100, "page": 1}, {"cid": 200, "page": 2}]
            }
        });
        assert_eq!(parse_view(&res, 2).unwrap(), 200);
        // out of range parts fall back to the first one
        assert_eq!(parse_view(&res, 9).unwrap(), 100);
    }

    #[test]
    fn api_errors_carry_the_message() {
        let res = json!({"code": -404, "message": "啥都木有"});
        assert_eq!(
            parse_view(&res, 1),
            Err(PlayerError::ApiError {
                error: "code -404: 啥都木有".to_string()
            })
        );
    }

    #[test]
    fn playurl_lists_parts_in_order() {
        let res = json!({
            "code": 0,
            "data": {
                "timelength": 1420500,
                "durl": [
                    {"order": 2, "url": "https://upos.example/2.flv", "length": 710000},
                    {"order": 1, "url": "https://upos.example/1.flv", "length": 710500}
                ]
            }
        });
        let (urls, duration) = parse_playurl(&res).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://upos.example/1.flv".to_string(),
                "https://upos.example/2.flv".to_string()
            ]
        );
        assert_eq!(duration, Some(1420.5));
    }

    #[test]
    fn playurl_without_parts_is_invalid() {
        let res = json!({"code": 0, "data": {"durl": []}});
        assert_eq!(parse_playurl(&res), Err(PlayerError::InvalidResponse));
        let res = json!({"code": 0, "data": {}});
        assert!(matches!(
            parse_playurl(&res),
            Err(PlayerError::InvalidResponseJson { .. })
        ));
    }
}
