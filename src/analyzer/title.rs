//! Title analyzer: turns a video filename into a displayable title and
//! detects show/episode patterns. Pure string processing; the sanitised
//! output is always a non-empty reduction of the input.

use std::sync::LazyLock;

use regex::Regex;

static RE_EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[[:alnum:]]{2,4}$").unwrap());
/// Bracketed info like [BDRip], [1080p], [SubGroup].
static RE_BRACKETED_INFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\[[^\]]*\]\s*").unwrap());
/// Parenthesized release info like (BD 720p), (V2) - but NOT years.
static RE_PAREN_RELEASE_INFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\((?:BD|DVD|BluRay|BDRip|WEB|HDTV|V\d+|\d{3,4}p)[^\)]*\)\s*").unwrap()
});
/// File size tokens such as 700MB or 1.4GB.
static RE_FILE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\s|-|_)(\d{1,4}(\.\d{1,3})?(MB|GB))\b").unwrap());
/// Word separators used by scene names.
static RE_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\._\+]+").unwrap());
static RE_RELEASE_INFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(xvid|h\.?264|h\.?265|x264|x265|hevc|avc|dvd|dvdrip|bdrip|brrip|bluray|blu-ray|webrip|web-dl|hdtv|hdtc|hdrip|aac|ac3|dts|flac|opus|atmos|mkv|mp4|avi|10\s?bits?|remux|proper|repack|multi|dual|dubbed|subbed|raw|[0-9]{3,4}[pi]|vost(\s?[a-z]{2})?|hbo|amc|amzn|nf|rarbg|yify|ettv|ethd|1337x|evo|xrg|horriblesubs|puyasubs!)\b",
    )
    .unwrap()
});
static RE_EMPTY_PAIRS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\(\)|\[\])").unwrap());
static RE_SPACE_COLLAPSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
/// Trailing release-group tag such as "-EMBER".
static RE_GROUP_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*-[A-Za-z0-9]+$").unwrap());

static RE_SEASON_EP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bS(\d{1,2})\s*E(\d{1,3})\b").unwrap());
static RE_CROSS_EP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})x(\d{1,3})\b").unwrap());
static RE_WORDED_EP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSeason\s+(\d{1,2})\s*[,\.]?\s*Episode\s+(\d{1,3})\b").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeMatch {
    pub season: i64,
    pub episode: i64,
    pub show_name: String,
    pub episode_title: Option<String>,
}

/// Strip release noise from a filename. If everything gets removed we were
/// too greedy: return the input unchanged.
pub fn sanitize(file_name: &str) -> String {
    let mut res = RE_EXTENSION.replace(file_name, "").into_owned();
    res = RE_FILE_SIZE.replace_all(&res, " ").into_owned();
    res = RE_BRACKETED_INFO.replace_all(&res, " ").into_owned();
    res = RE_PAREN_RELEASE_INFO.replace_all(&res, " ").into_owned();
    res = RE_SEPARATORS.replace_all(&res, " ").into_owned();
    res = RE_RELEASE_INFO.replace_all(&res, " ").into_owned();
    res = RE_EMPTY_PAIRS.replace_all(&res, " ").into_owned();
    res = RE_GROUP_SUFFIX.replace(&res, "").into_owned();
    res = RE_SPACE_COLLAPSE.replace_all(&res, " ").into_owned();
    let res = res.trim().trim_end_matches(['-', '_']).trim();
    if res.is_empty() {
        file_name.to_string()
    } else {
        res.to_string()
    }
}

/// Sanitise and look for an episode pattern. Returns the sanitised title
/// and, when a pattern matched, the split show name / episode title.
pub fn analyze(file_name: &str) -> (String, Option<EpisodeMatch>) {
    let sanitized = sanitize(file_name);

    for pattern in [&*RE_SEASON_EP, &*RE_WORDED_EP, &*RE_CROSS_EP] {
        if let Some(caps) = pattern.captures(&sanitized) {
            let (Some(season), Some(episode)) = (
                caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()),
                caps.get(2).and_then(|m| m.as_str().parse::<i64>().ok()),
            ) else {
                continue;
            };
            let whole = caps.get(0).unwrap();
            let show_name = sanitized[..whole.start()]
                .trim()
                .trim_end_matches(['-', '_'])
                .trim()
                .to_string();
            let episode_title = {
                let rest = sanitized[whole.end()..]
                    .trim()
                    .trim_start_matches(['-', '_'])
                    .trim();
                if rest.is_empty() {
                    None
                } else {
                    Some(rest.to_string())
                }
            };
            return (
                sanitized.clone(),
                Some(EpisodeMatch {
                    season,
                    episode,
                    show_name,
                    episode_title,
                }),
            );
        }
    }
    (sanitized, None)
}
