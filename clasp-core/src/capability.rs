//! Device identification: model-name patterns resolve to immutable capability
//! profiles, most specific pattern first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::KeyScheme;
use crate::frame::ProtocolVariant;

const MAX_REPEAT: usize = 32;

/// What one device model supports. Handed out behind an `Arc`; never mutated
/// after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilityProfile {
    pub name: String,
    pub manufacturer: String,
    pub variant: ProtocolVariant,
    pub key_scheme: KeyScheme,
    pub encrypted: bool,
    pub max_block_size: u32,
    pub alarm_slots: u8,
    pub reminder_slots: u8,
    pub reminder_message_length: u16,
    pub world_clock_slots: u8,
    pub features: Features,
}

/// Feature switches beyond the raw protocol: which screens and sync paths the
/// host should offer for this model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features {
    pub weather: bool,
    pub activity_fetching: bool,
    pub heart_rate_realtime: bool,
    pub stress: bool,
    pub spo2: bool,
    pub rem_sleep: bool,
    pub find_device: bool,
    pub smart_wakeup: bool,
    pub calendar_sync: bool,
    pub music_info: bool,
    pub unicode_emoji: bool,
    pub file_flashing: bool,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    BadPattern {
        pattern: String,
        reason: &'static str,
    },
    #[error("pattern {new:?} is ambiguous with already registered {existing:?}")]
    Ambiguous { new: String, existing: String },
}

/// The reported model name matched no registered pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device model {0:?} is not supported")]
pub struct NotSupported(pub String);

/// Pattern over model names. One atom per character, plus an optional
/// trailing `.*` that turns the atoms into a required prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ModelPattern {
    source: String,
    atoms: Vec<MatchAtom>,
    prefix_wildcard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MatchAtom {
    Literal(char),
    Any,
    Class(Vec<ClassItem>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassItem {
    Char(char),
    Range(char, char),
}

impl ModelPattern {
    /// Accepts literals, `.`, `[...]` classes with ranges, `{n}` repetition
    /// of the preceding atom, and a final `.*`. Anchors are implied; leading
    /// `^` and trailing `$` are tolerated and stripped.
    fn parse(source: &str) -> Result<Self, RegistryError> {
        let bad = |reason: &'static str| RegistryError::BadPattern {
            pattern: source.to_string(),
            reason,
        };
        let mut body = source;
        if let Some(stripped) = body.strip_prefix('^') {
            body = stripped;
        }
        if let Some(stripped) = body.strip_suffix('$') {
            body = stripped;
        }
        let mut prefix_wildcard = false;
        if let Some(stripped) = body.strip_suffix(".*") {
            body = stripped;
            prefix_wildcard = true;
        }

        let mut atoms = Vec::new();
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '[' => {
                    let mut items = Vec::new();
                    loop {
                        match chars.next() {
                            None => return Err(bad("unterminated character class")),
                            Some(']') => break,
                            Some(lo) => {
                                if chars.peek() == Some(&'-') {
                                    chars.next();
                                    match chars.peek().copied() {
                                        Some(']') | None => {
                                            // Trailing dash is a literal.
                                            items.push(ClassItem::Char(lo));
                                            items.push(ClassItem::Char('-'));
                                        }
                                        Some(hi) => {
                                            chars.next();
                                            if hi < lo {
                                                return Err(bad("reversed character range"));
                                            }
                                            items.push(ClassItem::Range(lo, hi));
                                        }
                                    }
                                } else {
                                    items.push(ClassItem::Char(lo));
                                }
                            }
                        }
                    }
                    if items.is_empty() {
                        return Err(bad("empty character class"));
                    }
                    atoms.push(MatchAtom::Class(items));
                }
                '{' => {
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            _ => return Err(bad("malformed repetition")),
                        }
                    }
                    let n: usize = digits.parse().map_err(|_| bad("malformed repetition"))?;
                    if n == 0 {
                        return Err(bad("zero repetition"));
                    }
                    if n > MAX_REPEAT {
                        return Err(bad("repetition too large"));
                    }
                    let Some(last) = atoms.last().cloned() else {
                        return Err(bad("repetition without a preceding atom"));
                    };
                    for _ in 1..n {
                        atoms.push(last.clone());
                    }
                }
                '*' => return Err(bad("wildcard allowed only as a trailing .*")),
                '.' => atoms.push(MatchAtom::Any),
                other => atoms.push(MatchAtom::Literal(other)),
            }
        }
        if atoms.is_empty() && !prefix_wildcard {
            return Err(bad("empty pattern"));
        }
        Ok(Self {
            source: source.to_string(),
            atoms,
            prefix_wildcard,
        })
    }

    fn matches(&self, model: &str) -> bool {
        let mut chars = model.chars();
        for atom in &self.atoms {
            let Some(c) = chars.next() else { return false };
            if !atom.matches(c) {
                return false;
            }
        }
        self.prefix_wildcard || chars.next().is_none()
    }

    /// Lower orders first. Exact literals beat classes, classes beat `.`,
    /// and any fixed-length pattern beats a prefix wildcard.
    fn specificity(&self) -> (bool, usize, usize) {
        let any = self
            .atoms
            .iter()
            .filter(|a| matches!(a, MatchAtom::Any))
            .count();
        let class = self
            .atoms
            .iter()
            .filter(|a| matches!(a, MatchAtom::Class(_)))
            .count();
        (self.prefix_wildcard, any, class)
    }

    /// Whether some model name could match both patterns.
    fn intersects(&self, other: &ModelPattern) -> bool {
        match (self.prefix_wildcard, other.prefix_wildcard) {
            (false, false) if self.atoms.len() != other.atoms.len() => return false,
            (true, false) if other.atoms.len() < self.atoms.len() => return false,
            (false, true) if self.atoms.len() < other.atoms.len() => return false,
            _ => {}
        }
        self.atoms
            .iter()
            .zip(other.atoms.iter())
            .all(|(a, b)| a.intersects(b))
    }
}

impl MatchAtom {
    fn matches(&self, c: char) -> bool {
        match self {
            MatchAtom::Literal(l) => *l == c,
            MatchAtom::Any => true,
            MatchAtom::Class(items) => items.iter().any(|item| item.contains(c)),
        }
    }

    fn intersects(&self, other: &MatchAtom) -> bool {
        match (self, other) {
            (MatchAtom::Any, _) | (_, MatchAtom::Any) => true,
            (MatchAtom::Literal(a), MatchAtom::Literal(b)) => a == b,
            (MatchAtom::Literal(l), MatchAtom::Class(items))
            | (MatchAtom::Class(items), MatchAtom::Literal(l)) => {
                items.iter().any(|item| item.contains(*l))
            }
            (MatchAtom::Class(a), MatchAtom::Class(b)) => a
                .iter()
                .any(|x| b.iter().any(|y| x.overlaps(y))),
        }
    }
}

impl ClassItem {
    fn contains(&self, c: char) -> bool {
        match self {
            ClassItem::Char(l) => *l == c,
            ClassItem::Range(lo, hi) => (*lo..=*hi).contains(&c),
        }
    }

    fn overlaps(&self, other: &ClassItem) -> bool {
        match (self, other) {
            (ClassItem::Char(a), ClassItem::Char(b)) => a == b,
            (ClassItem::Char(c), ClassItem::Range(lo, hi))
            | (ClassItem::Range(lo, hi), ClassItem::Char(c)) => (*lo..=*hi).contains(c),
            (ClassItem::Range(lo1, hi1), ClassItem::Range(lo2, hi2)) => {
                lo1.max(lo2) <= hi1.min(hi2)
            }
        }
    }
}

struct RegistryEntry {
    pattern: ModelPattern,
    profile: Arc<DeviceCapabilityProfile>,
}

/// All known device models. Ambiguity between patterns of equal specificity
/// is rejected when the second one registers, so lookups never tie.
pub struct CapabilityRegistry {
    entries: Vec<RegistryEntry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// The stock model table.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register("fenix 7", fenix_7())?;
        registry.register("Venu 3", venu_3())?;
        registry.register("Redmi Watch 5 Active [0-9A-F]{4}", redmi_watch_5_active())?;
        registry.register("Redmi Buds 5 Pro", redmi_buds_5_pro())?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        pattern: &str,
        profile: DeviceCapabilityProfile,
    ) -> Result<(), RegistryError> {
        let pattern = ModelPattern::parse(pattern)?;
        let specificity = pattern.specificity();
        for entry in &self.entries {
            if entry.pattern.specificity() == specificity && entry.pattern.intersects(&pattern) {
                return Err(RegistryError::Ambiguous {
                    new: pattern.source,
                    existing: entry.pattern.source.clone(),
                });
            }
        }
        self.entries.push(RegistryEntry {
            pattern,
            profile: Arc::new(profile),
        });
        Ok(())
    }

    /// Resolve a reported model name. Among all matching patterns the most
    /// specific one wins; equal-specificity matches cannot occur because
    /// `register` rejects them.
    pub fn identify(&self, model: &str) -> Result<Arc<DeviceCapabilityProfile>, NotSupported> {
        self.entries
            .iter()
            .filter(|entry| entry.pattern.matches(model))
            .min_by_key(|entry| entry.pattern.specificity())
            .map(|entry| Arc::clone(&entry.profile))
            .ok_or_else(|| NotSupported(model.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn fenix_7() -> DeviceCapabilityProfile {
    DeviceCapabilityProfile {
        name: "fenix 7".into(),
        manufacturer: "Garmin".into(),
        variant: ProtocolVariant::NewSync,
        key_scheme: KeyScheme::Agreement,
        encrypted: true,
        max_block_size: 8192,
        alarm_slots: 10,
        reminder_slots: 50,
        reminder_message_length: 255,
        world_clock_slots: 4,
        features: Features {
            weather: true,
            activity_fetching: true,
            heart_rate_realtime: true,
            stress: true,
            spo2: true,
            rem_sleep: true,
            find_device: true,
            smart_wakeup: true,
            calendar_sync: true,
            music_info: true,
            unicode_emoji: true,
            file_flashing: true,
        },
    }
}

fn venu_3() -> DeviceCapabilityProfile {
    DeviceCapabilityProfile {
        name: "Venu 3".into(),
        manufacturer: "Garmin".into(),
        variant: ProtocolVariant::NewSync,
        key_scheme: KeyScheme::Agreement,
        encrypted: true,
        max_block_size: 4096,
        alarm_slots: 10,
        reminder_slots: 50,
        reminder_message_length: 255,
        world_clock_slots: 2,
        features: Features {
            weather: true,
            activity_fetching: true,
            heart_rate_realtime: true,
            stress: true,
            spo2: true,
            rem_sleep: true,
            find_device: true,
            smart_wakeup: false,
            calendar_sync: true,
            music_info: true,
            unicode_emoji: true,
            file_flashing: false,
        },
    }
}

fn redmi_watch_5_active() -> DeviceCapabilityProfile {
    DeviceCapabilityProfile {
        name: "Redmi Watch 5 Active".into(),
        manufacturer: "Xiaomi".into(),
        variant: ProtocolVariant::Legacy,
        key_scheme: KeyScheme::LegacyMix,
        encrypted: true,
        max_block_size: 960,
        alarm_slots: 10,
        reminder_slots: 50,
        reminder_message_length: 20,
        world_clock_slots: 0,
        features: Features {
            weather: true,
            activity_fetching: true,
            heart_rate_realtime: true,
            stress: true,
            spo2: true,
            rem_sleep: true,
            find_device: true,
            smart_wakeup: true,
            calendar_sync: true,
            music_info: true,
            unicode_emoji: true,
            file_flashing: true,
        },
    }
}

fn redmi_buds_5_pro() -> DeviceCapabilityProfile {
    DeviceCapabilityProfile {
        name: "Redmi Buds 5 Pro".into(),
        manufacturer: "Xiaomi".into(),
        variant: ProtocolVariant::Legacy,
        key_scheme: KeyScheme::LegacyMix,
        encrypted: false,
        max_block_size: 512,
        alarm_slots: 0,
        reminder_slots: 0,
        reminder_message_length: 0,
        world_clock_slots: 0,
        features: Features {
            find_device: true,
            ..Features::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> DeviceCapabilityProfile {
        DeviceCapabilityProfile {
            name: name.into(),
            manufacturer: "Test".into(),
            variant: ProtocolVariant::Legacy,
            key_scheme: KeyScheme::LegacyMix,
            encrypted: false,
            max_block_size: 256,
            alarm_slots: 0,
            reminder_slots: 0,
            reminder_message_length: 0,
            world_clock_slots: 0,
            features: Features::default(),
        }
    }

    #[test]
    fn builtin_resolves_garmin_models_distinctly() {
        let registry = CapabilityRegistry::builtin().unwrap();
        assert_eq!(registry.len(), 4);
        let fenix = registry.identify("fenix 7").unwrap();
        let venu = registry.identify("Venu 3").unwrap();
        assert_eq!(fenix.name, "fenix 7");
        assert_eq!(venu.name, "Venu 3");
        assert_ne!(fenix, venu);
        assert_eq!(fenix.variant, ProtocolVariant::NewSync);
        assert_eq!(fenix.key_scheme, KeyScheme::Agreement);
    }

    #[test]
    fn serial_suffix_matches_the_class_pattern() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let profile = registry.identify("Redmi Watch 5 Active 1A2B").unwrap();
        assert_eq!(profile.name, "Redmi Watch 5 Active");
        assert_eq!(profile.variant, ProtocolVariant::Legacy);

        // Classes are case sensitive.
        assert!(registry.identify("Redmi Watch 5 Active 1a2b").is_err());
        // Wrong suffix length.
        assert!(registry.identify("Redmi Watch 5 Active 1A2").is_err());
    }

    #[test]
    fn redmi_watch_carries_the_xiaomi_capability_set() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let profile = registry.identify("Redmi Watch 5 Active 0F3C").unwrap();
        assert_eq!(profile.alarm_slots, 10);
        assert_eq!(profile.reminder_slots, 50);
        assert_eq!(profile.reminder_message_length, 20);
        assert_eq!(profile.world_clock_slots, 0);
        assert!(profile.features.rem_sleep);
        assert!(profile.features.smart_wakeup);
        assert!(profile.features.calendar_sync);
        assert!(profile.features.unicode_emoji);
        assert!(profile.features.file_flashing);
    }

    #[test]
    fn unknown_model_is_not_supported() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let err = registry.identify("Pixel Watch 2").unwrap_err();
        assert_eq!(err, NotSupported("Pixel Watch 2".to_string()));
    }

    #[test]
    fn most_specific_pattern_wins() {
        let mut registry = CapabilityRegistry::builtin().unwrap();
        registry
            .register("Redmi Watch 5 Active 1A2B", profile("exact override"))
            .unwrap();
        assert_eq!(
            registry.identify("Redmi Watch 5 Active 1A2B").unwrap().name,
            "exact override"
        );
        // Other serials still hit the class pattern.
        assert_eq!(
            registry.identify("Redmi Watch 5 Active FFFF").unwrap().name,
            "Redmi Watch 5 Active"
        );
    }

    #[test]
    fn prefix_wildcard_ranks_after_fixed_patterns() {
        let mut registry = CapabilityRegistry::builtin().unwrap();
        registry.register("Venu .*", profile("venu fallback")).unwrap();
        assert_eq!(registry.identify("Venu 3").unwrap().name, "Venu 3");
        assert_eq!(
            registry.identify("Venu 2 Plus").unwrap().name,
            "venu fallback"
        );
    }

    #[test]
    fn equal_specificity_overlap_is_rejected_at_registration() {
        let mut registry = CapabilityRegistry::new();
        registry.register("Amazfit GTS [0-9]", profile("a")).unwrap();
        let err = registry
            .register("Amazfit GTS [0-4]", profile("b"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Ambiguous { .. }));
    }

    #[test]
    fn duplicate_pattern_is_rejected() {
        let mut registry = CapabilityRegistry::new();
        registry.register("Pixel Buds", profile("a")).unwrap();
        assert!(matches!(
            registry.register("Pixel Buds", profile("b")),
            Err(RegistryError::Ambiguous { .. })
        ));
    }

    #[test]
    fn disjoint_patterns_of_equal_specificity_coexist() {
        let mut registry = CapabilityRegistry::new();
        registry.register("Band [0-4]", profile("low")).unwrap();
        registry.register("Band [5-9]", profile("high")).unwrap();
        registry.register("AB", profile("short")).unwrap();
        registry.register("ABC", profile("long")).unwrap();
        assert_eq!(registry.identify("Band 2").unwrap().name, "low");
        assert_eq!(registry.identify("Band 7").unwrap().name, "high");
    }

    #[test]
    fn anchors_are_tolerated() {
        let mut registry = CapabilityRegistry::new();
        registry.register("^Pixel Buds$", profile("buds")).unwrap();
        assert_eq!(registry.identify("Pixel Buds").unwrap().name, "buds");
        assert!(registry.identify("Pixel Buds Pro").is_err());
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        let mut registry = CapabilityRegistry::new();
        for bad in ["", "{3}", "Watch [A-", "Watch [Z-A]", "Watch x*", "W{0}"] {
            assert!(
                matches!(
                    registry.register(bad, profile("p")),
                    Err(RegistryError::BadPattern { .. })
                ),
                "pattern {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn repetition_expands_the_preceding_atom() {
        let mut registry = CapabilityRegistry::new();
        registry.register("Tag [0-9]{3}", profile("tag")).unwrap();
        assert!(registry.identify("Tag 123").is_ok());
        assert!(registry.identify("Tag 12").is_err());
        assert!(registry.identify("Tag 1234").is_err());
    }

    #[test]
    fn profiles_are_shared_not_copied() {
        let registry = CapabilityRegistry::builtin().unwrap();
        let a = registry.identify("fenix 7").unwrap();
        let b = registry.identify("fenix 7").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
