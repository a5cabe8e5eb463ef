// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Content Encoding Negotiation
//!
//! Parses Accept-Encoding style preference lists (`token[;q=weight]`, comma
//! separated) and picks the content encoding a reply should be compressed
//! with. A missing header means any encoding is acceptable and identity is
//! preferred. A malformed entry invalidates the whole header.

use crate::errors::EncodingError;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

pub const IDENTITY: &str = "identity";
pub const GZIP: &str = "gzip";
pub const DEFLATE: &str = "deflate";
pub const WILDCARD: &str = "*";

/// Encodings the bridge can produce and read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Every encoding, identity first.
    pub const ALL: [ContentEncoding; 3] = [
        ContentEncoding::Identity,
        ContentEncoding::Gzip,
        ContentEncoding::Deflate,
    ];

    pub fn token(self) -> &'static str {
        match self {
            ContentEncoding::Identity => IDENTITY,
            ContentEncoding::Gzip => GZIP,
            ContentEncoding::Deflate => DEFLATE,
        }
    }

    /// Case-insensitive lookup of a content-encoding token.
    pub fn from_token(token: &str) -> Option<Self> {
        ContentEncoding::ALL
            .into_iter()
            .find(|encoding| encoding.token().eq_ignore_ascii_case(token))
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One acceptable token with its weight in (0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Preference {
    pub token: String,
    pub weight: f32,
}

/// A parsed preference list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptEncoding {
    raw: String,
    acceptable: Vec<Preference>,
    unacceptable: BTreeSet<String>,
}

impl AcceptEncoding {
    /// Parses a header value.
    ///
    /// Empty entries are skipped. Tokens are lowercased; when a token repeats
    /// the higher weight wins. Acceptable tokens are ordered by descending
    /// weight, ties keeping their first position. Tokens with weight 0 end
    /// up in the unacceptable set.
    pub fn parse(header: &str) -> Result<Self, EncodingError> {
        let mut weights: HashMap<String, (f32, usize)> = HashMap::new();

        for (position, entry) in header.split(',').map(str::trim).enumerate() {
            if entry.is_empty() {
                continue;
            }

            let (token, weight) = parse_entry(entry)?;
            weights
                .entry(token)
                .and_modify(|(current, _)| *current = current.max(weight))
                .or_insert((weight, position));
        }

        let mut ranked: Vec<(String, f32, usize)> = weights
            .into_iter()
            .map(|(token, (weight, position))| (token, weight, position))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut parsed = AcceptEncoding {
            raw: header.to_owned(),
            ..AcceptEncoding::default()
        };
        for (token, weight, _) in ranked {
            if weight > 0.0 {
                parsed.acceptable.push(Preference { token, weight });
            } else {
                parsed.unacceptable.insert(token);
            }
        }

        Ok(parsed)
    }

    pub fn acceptable(&self) -> &[Preference] {
        &self.acceptable
    }

    pub fn unacceptable(&self) -> &BTreeSet<String> {
        &self.unacceptable
    }

    fn mentions(&self, token: &str) -> bool {
        self.unacceptable.contains(token) || self.acceptable.iter().any(|p| p.token == token)
    }

    /// Picks the most preferred encoding among `supported`.
    ///
    /// A wildcard stands for any supported encoding the list does not name,
    /// identity first. When nothing listed matches, identity is used unless
    /// it was ruled out explicitly or through `*;q=0`.
    pub fn select(&self, supported: &[ContentEncoding]) -> Result<ContentEncoding, EncodingError> {
        for preference in &self.acceptable {
            if preference.token == WILDCARD {
                let unnamed: Vec<ContentEncoding> = supported
                    .iter()
                    .copied()
                    .filter(|encoding| !self.mentions(encoding.token()))
                    .collect();

                if unnamed.contains(&ContentEncoding::Identity) {
                    return Ok(ContentEncoding::Identity);
                }
                if let Some(encoding) = unnamed.first() {
                    return Ok(*encoding);
                }
                continue;
            }

            if let Some(encoding) = ContentEncoding::from_token(&preference.token) {
                if supported.contains(&encoding) {
                    return Ok(encoding);
                }
            }
        }

        let identity_refused = self.unacceptable.contains(IDENTITY)
            || (self.unacceptable.contains(WILDCARD) && !self.mentions(IDENTITY));
        if identity_refused || !supported.contains(&ContentEncoding::Identity) {
            return Err(EncodingError::NotAcceptable(self.raw.clone()));
        }

        Ok(ContentEncoding::Identity)
    }
}

/// Negotiates an encoding from an optional header value; no header means
/// identity.
pub fn negotiate(
    header: Option<&str>,
    supported: &[ContentEncoding],
) -> Result<ContentEncoding, EncodingError> {
    match header {
        None => Ok(ContentEncoding::Identity),
        Some(raw) => AcceptEncoding::parse(raw)?.select(supported),
    }
}

fn parse_entry(entry: &str) -> Result<(String, f32), EncodingError> {
    let mut parts = entry.split(';').map(str::trim);
    let token = parts.next().unwrap_or_default();

    if token.is_empty() || !token.chars().all(is_token_char) {
        return Err(EncodingError::Malformed(entry.to_owned()));
    }

    let mut weight = None;
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            return Err(EncodingError::Malformed(entry.to_owned()));
        };
        if !key.trim().eq_ignore_ascii_case("q") || weight.is_some() {
            return Err(EncodingError::Malformed(entry.to_owned()));
        }
        weight = Some(parse_weight(value.trim(), entry)?);
    }

    Ok((token.to_ascii_lowercase(), weight.unwrap_or(1.0)))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '*')
}

fn parse_weight(value: &str, entry: &str) -> Result<f32, EncodingError> {
    let well_formed = !value.is_empty()
        && value.chars().all(|c| c.is_ascii_digit() || c == '.')
        && value.matches('.').count() <= 1
        && !value.starts_with('.');
    if !well_formed {
        return Err(EncodingError::Malformed(entry.to_owned()));
    }

    let weight: f32 = value
        .parse()
        .map_err(|_| EncodingError::Malformed(entry.to_owned()))?;
    if !(0.0..=1.0).contains(&weight) {
        return Err(EncodingError::WeightOutOfRange(value.to_owned()));
    }

    Ok(weight)
}
