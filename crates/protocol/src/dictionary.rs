//! Versioned string tables used by the token codec.
//!
//! A [`Dictionary`] pairs a primary table, whose entries encode as a single
//! byte, with a secondary table, whose entries encode as a page marker plus
//! one index byte. One dictionary is selected per protocol version before any
//! encode or decode and is then shared immutably by every codec call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of usable single-byte indices. Bytes from 0xEC upwards are markers.
pub const MAX_PRIMARY_ENTRIES: usize = 0xEC;

/// Entries per secondary page.
pub const SECONDARY_PAGE_SIZE: usize = 256;

/// Number of secondary pages (markers 0xEC to 0xEF).
pub const SECONDARY_PAGES: usize = 4;

/// Total capacity of the secondary table.
pub const MAX_SECONDARY_ENTRIES: usize = SECONDARY_PAGE_SIZE * SECONDARY_PAGES;

/// Dictionary version shipped with this crate.
pub const BUILTIN_VERSION: u8 = 3;

/// Serializable form of a dictionary, as stored in a tables file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryTables {
    /// Protocol dictionary version these tables belong to.
    pub version: u8,
    /// Single-byte table. Entry 0 must be the empty string.
    pub primary: Vec<String>,
    /// Two-byte table.
    #[serde(default)]
    pub secondary: Vec<String>,
}

/// An immutable, versioned pair of string tables.
#[derive(Debug, Clone)]
pub struct Dictionary {
    version: u8,
    primary: Vec<String>,
    secondary: Vec<String>,
    primary_lookup: HashMap<String, u8>,
    secondary_lookup: HashMap<String, u16>,
}

impl Dictionary {
    /// Builds a dictionary from raw tables, validating the token space limits.
    pub fn from_tables(tables: DictionaryTables) -> Result<Self> {
        let DictionaryTables {
            version,
            primary,
            secondary,
        } = tables;

        if primary.first().map(String::as_str) != Some("") {
            return Err(Error::InvalidDictionary(
                "primary entry 0 must be the empty string".to_string(),
            ));
        }
        if primary.len() > MAX_PRIMARY_ENTRIES {
            return Err(Error::InvalidDictionary(format!(
                "primary table has {} entries, maximum is {}",
                primary.len(),
                MAX_PRIMARY_ENTRIES
            )));
        }
        if secondary.len() > MAX_SECONDARY_ENTRIES {
            return Err(Error::InvalidDictionary(format!(
                "secondary table has {} entries, maximum is {}",
                secondary.len(),
                MAX_SECONDARY_ENTRIES
            )));
        }

        // First occurrence wins so that encoding is stable for duplicated words.
        let mut primary_lookup = HashMap::with_capacity(primary.len());
        for (index, word) in primary.iter().enumerate().skip(1) {
            if !word.is_empty() {
                primary_lookup.entry(word.clone()).or_insert(index as u8);
            }
        }
        let mut secondary_lookup = HashMap::with_capacity(secondary.len());
        for (index, word) in secondary.iter().enumerate() {
            if !word.is_empty() {
                secondary_lookup.entry(word.clone()).or_insert(index as u16);
            }
        }

        Ok(Self {
            version,
            primary,
            secondary,
            primary_lookup,
            secondary_lookup,
        })
    }

    /// Selects the built-in tables for a dictionary version.
    pub fn select(version: u8) -> Result<Self> {
        match version {
            BUILTIN_VERSION => Ok(Self::builtin()),
            other => Err(Error::InvalidDictionary(format!(
                "no built-in tables for version {}",
                other
            ))),
        }
    }

    /// Returns the dictionary shipped with this crate.
    pub fn builtin() -> Self {
        let tables = DictionaryTables {
            version: BUILTIN_VERSION,
            primary: PRIMARY_V3.iter().map(|s| s.to_string()).collect(),
            secondary: SECONDARY_V3.iter().map(|s| s.to_string()).collect(),
        };
        match Self::from_tables(tables) {
            Ok(dict) => dict,
            Err(e) => unreachable!("built-in dictionary tables are invalid: {}", e),
        }
    }

    /// Returns the dictionary version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Looks up a word in the primary table.
    pub fn primary_index(&self, word: &str) -> Option<u8> {
        self.primary_lookup.get(word).copied()
    }

    /// Looks up a word in the secondary table.
    pub fn secondary_index(&self, word: &str) -> Option<u16> {
        self.secondary_lookup.get(word).copied()
    }

    /// Resolves a primary index.
    pub fn primary(&self, index: u8) -> Result<&str> {
        self.primary
            .get(index as usize)
            .map(String::as_str)
            .ok_or(Error::UnknownToken {
                table: "primary",
                index: index as u16,
            })
    }

    /// Resolves an extended secondary index.
    pub fn secondary(&self, index: u16) -> Result<&str> {
        self.secondary
            .get(index as usize)
            .map(String::as_str)
            .ok_or(Error::UnknownToken {
                table: "secondary",
                index,
            })
    }

    /// Returns a serializable copy of the tables.
    pub fn tables(&self) -> DictionaryTables {
        DictionaryTables {
            version: self.version,
            primary: self.primary.clone(),
            secondary: self.secondary.clone(),
        }
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::builtin()
    }
}

const PRIMARY_V3: &[&str] = &[
    "",
    "xmlstreamstart",
    "xmlstreamend",
    "s.whatsapp.net",
    "type",
    "participant",
    "from",
    "receipt",
    "id",
    "notification",
    "disappearing_mode",
    "status",
    "jid",
    "broadcast",
    "user",
    "devices",
    "device_hash",
    "to",
    "offline",
    "message",
    "result",
    "class",
    "xmlns",
    "duration",
    "notify",
    "iq",
    "t",
    "ack",
    "g.us",
    "enc",
    "urn:xmpp:whatsapp:push",
    "presence",
    "config_value",
    "picture",
    "verified_name",
    "config_code",
    "key-index-list",
    "contact",
    "mediatype",
    "routing_info",
    "edge_routing",
    "get",
    "read",
    "urn:xmpp:ping",
    "fallback_hostname",
    "0",
    "chatstate",
    "business_hours_config",
    "unavailable",
    "download_buckets",
    "skmsg",
    "verified_level",
    "composing",
    "handshake",
    "device-list",
    "media",
    "text",
    "fallback_ip4",
    "media_conn",
    "device",
    "creation",
    "location",
    "config",
    "item",
    "fallback_ip6",
    "count",
    "w:profile:picture",
    "image",
    "business",
    "2",
    "hostname",
    "call-creator",
    "display_name",
    "relaylatency",
    "platform",
    "abprops",
    "success",
    "msg",
    "offline_preview",
    "prop",
    "key-index",
    "v",
    "day_of_week",
    "pkmsg",
    "version",
    "1",
    "ping",
    "w:p",
    "download",
    "video",
    "set",
    "specific_hours",
    "props",
    "primary",
    "unknown",
    "hash",
    "commerce_experience",
    "last",
    "subscribe",
    "max_buckets",
    "call",
    "profile",
    "member_since_text",
    "close_time",
    "call-id",
    "sticker",
    "mode",
    "participants",
    "value",
    "query",
    "profile_options",
    "open_time",
    "code",
    "list",
    "host",
    "ts",
    "contacts",
    "upload",
    "lid",
    "preview",
    "update",
    "usync",
    "w:stats",
    "delivery",
    "auth_ttl",
    "context",
    "fail",
    "cart_enabled",
    "appdata",
    "category",
    "atn",
    "direct_connection",
    "decrypt-fail",
    "relay_id",
    "mmg-fallback.whatsapp.net",
    "target",
    "available",
    "name",
    "last_id",
    "mmg.whatsapp.net",
    "categories",
    "401",
    "is_new",
    "index",
    "tctoken",
    "ip4",
    "token_id",
    "latency",
    "recipient",
    "edit",
    "ip6",
    "add",
    "thumbnail-document",
    "26",
    "paused",
    "true",
    "identity",
    "stream:error",
    "key",
    "sidelist",
    "background",
    "audio",
    "3",
    "thumbnail-image",
    "biz-cover-photo",
    "cat",
    "gcm",
    "thumbnail-video",
    "error",
    "auth",
    "deny",
    "serial",
    "in",
    "registration",
    "thumbnail-link",
    "remove",
    "00",
    "gif",
    "thumbnail-gif",
    "tag",
    "capability",
    "multicast",
    "item-not-found",
    "description",
    "business_hours",
    "config_expo_key",
    "md-app-state",
    "expiration",
    "fallback",
    "ttl",
    "300",
    "md-msg-hist",
    "device_orientation",
    "out",
    "w:m",
    "open_24h",
    "side_list",
    "token",
    "inactive",
    "01",
    "document",
    "te2",
    "played",
    "encrypt",
    "msgr",
    "hide",
    "direct_path",
    "12",
    "state",
    "not-authorized",
    "url",
    "terminate",
    "signature",
    "status-revoke-delay",
    "02",
    "te",
    "linked_accounts",
    "trusted_contact",
    "timezone",
    "ptt",
    "kyc-id",
    "privacy_token",
    "readreceipts",
    "appointment_only",
    "address",
    "expected_ts",
    "privacy",
    "7",
    "android",
    "interactive",
    "device-identity",
    "enabled",
    "attribute_padding",
    "1080",
    "03",
    "screen_height",
];

const SECONDARY_V3: &[&str] = &[
    "read-self",
    "active",
    "fbns",
    "protocol",
    "reaction",
    "screen_width",
    "heartbeat",
    "deviceid",
    "2:47DEQpj8",
    "uploadfieldstat",
    "voip_settings",
    "retry",
    "priority",
    "longitude",
    "conflict",
    "false",
    "ig_professional",
    "replaced",
    "preaccept",
    "cover_photo",
    "uncompressed",
    "encopt",
    "ppic",
    "04",
    "passive",
    "status-revoke-drop",
    "keygen",
    "540",
    "offer",
    "rate",
    "opus",
    "latitude",
    "w:gp2",
    "ver",
    "4",
    "business_profile",
    "medium",
    "sender",
    "prev_v_id",
    "email",
    "website",
    "invited",
    "sign_credential",
    "05",
    "transport",
    "skey",
    "reason",
    "peer_abtest_bucket",
    "America/Sao_Paulo",
    "appid",
    "refresh",
    "100",
    "06",
    "404",
    "101",
    "104",
    "107",
    "102",
    "109",
    "103",
    "member_add_mode",
    "105",
    "transaction-id",
    "110",
    "106",
    "outgoing",
    "108",
    "111",
    "tokens",
    "followers",
    "ig_handle",
    "self_pid",
    "tue",
    "dec",
    "thu",
    "joinable",
    "peer_pid",
    "mon",
    "features",
    "wed",
    "peer_device_presence",
    "pn",
    "delete",
    "07",
    "fri",
    "audio_duration",
    "admin",
    "connected",
    "delta",
    "rcat",
    "disable",
    "collection",
    "08",
    "480",
    "sat",
    "phash",
    "all",
    "invite",
    "accept",
    "critical_unblock_low",
    "group_update",
    "signed_credential",
    "blinded_credential",
    "eph_setting",
    "net",
    "09",
    "background_location",
    "refresh_id",
    "Asia/Kolkata",
    "privacy_mode_ts",
    "account_sync",
    "voip_payload_type",
    "service_areas",
    "acs_public_key",
    "v_id",
    "0a",
    "fallback_class",
    "relay",
    "actual_actors",
    "metadata",
    "w:biz",
    "5",
    "connected-limit",
    "notice",
    "0b",
    "host_storage",
    "fb_page",
    "subject",
    "privatestats",
    "invis",
    "groupadd",
    "010",
    "note.m4r",
    "uuid",
    "0c",
    "8000",
    "sun",
    "372",
    "1020",
    "stage",
    "1200",
    "720",
    "canonical",
    "fb",
    "011",
    "video_duration",
    "0d",
    "1140",
    "superadmin",
    "012",
    "Opening.m4r",
    "keystore_attestation",
    "dleq_proof",
    "013",
    "timestamp",
    "ab_key",
    "w:sync:app:state",
    "0e",
    "vertical",
    "600",
    "p_v_id",
    "6",
    "likes",
    "014",
    "500",
    "1260",
    "creator",
    "0f",
    "rte",
    "destination",
    "group",
    "group_info",
    "syncd_anti_tampering_fatal_exception_enabled",
    "015",
    "dl_bw",
    "Asia/Jakarta",
    "vp8/h.264",
    "online",
    "1320",
    "fb:multiway",
    "10",
    "timeout",
    "016",
    "nse_retry",
    "urn:xmpp:whatsapp:dirty",
    "017",
    "is_sidecar",
    "pair-device",
    "pair-success",
    "pair-device-sign",
    "remove-companion-device",
    "companion-platform",
    "companion_enc_static",
    "link_code_companion_reg",
    "link_code_pairing_ref",
    "link_code_pairing_wrapped_companion_ephemeral_pub",
    "link_code_pairing_nonce",
    "primary_identity_pub",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(primary: &[&str], secondary: &[&str]) -> DictionaryTables {
        DictionaryTables {
            version: 9,
            primary: primary.iter().map(|s| s.to_string()).collect(),
            secondary: secondary.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_builtin_is_valid() {
        let dict = Dictionary::builtin();
        assert_eq!(dict.version(), BUILTIN_VERSION);
        assert_eq!(dict.primary(0).unwrap(), "");
        assert_eq!(dict.primary_index("s.whatsapp.net"), Some(3));
        assert!(dict.secondary_index("read-self").is_some());
    }

    #[test]
    fn test_builtin_fits_token_space() {
        assert!(PRIMARY_V3.len() <= MAX_PRIMARY_ENTRIES);
        assert!(SECONDARY_V3.len() <= MAX_SECONDARY_ENTRIES);
    }

    #[test]
    fn test_select_known_and_unknown_versions() {
        assert!(Dictionary::select(BUILTIN_VERSION).is_ok());
        let err = Dictionary::select(1).unwrap_err();
        assert!(matches!(err, Error::InvalidDictionary(_)));
    }

    #[test]
    fn test_entry_zero_must_be_empty() {
        let err = Dictionary::from_tables(tables(&["iq", "type"], &[])).unwrap_err();
        assert!(matches!(err, Error::InvalidDictionary(_)));
    }

    #[test]
    fn test_primary_table_too_large() {
        let mut primary = vec![String::new()];
        primary.extend((1..=MAX_PRIMARY_ENTRIES).map(|i| format!("w{}", i)));
        let err = Dictionary::from_tables(DictionaryTables {
            version: 1,
            primary,
            secondary: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDictionary(_)));
    }

    #[test]
    fn test_secondary_table_too_large() {
        let secondary = (0..=MAX_SECONDARY_ENTRIES)
            .map(|i| format!("s{}", i))
            .collect();
        let err = Dictionary::from_tables(DictionaryTables {
            version: 1,
            primary: vec![String::new()],
            secondary,
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDictionary(_)));
    }

    #[test]
    fn test_lookup_first_occurrence_wins() {
        let dict = Dictionary::from_tables(tables(&["", "iq", "iq"], &["x", "x"])).unwrap();
        assert_eq!(dict.primary_index("iq"), Some(1));
        assert_eq!(dict.secondary_index("x"), Some(0));
    }

    #[test]
    fn test_unknown_indices() {
        let dict = Dictionary::from_tables(tables(&["", "iq"], &["x"])).unwrap();
        assert!(matches!(
            dict.primary(2),
            Err(Error::UnknownToken {
                table: "primary",
                index: 2
            })
        ));
        assert!(matches!(
            dict.secondary(1),
            Err(Error::UnknownToken {
                table: "secondary",
                index: 1
            })
        ));
    }

    #[test]
    fn test_tables_roundtrip() {
        let dict = Dictionary::builtin();
        let rebuilt = Dictionary::from_tables(dict.tables()).unwrap();
        assert_eq!(rebuilt.tables(), dict.tables());
    }
}
