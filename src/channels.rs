//! Canonical instrument-channel registry.
//!
//! Every analysis in the system is keyed to a fixed set of session channels
//! (bass, drums, skank guitar, ...). The registry maps each channel to an
//! agent profile (role, ranges, behavioral traits, tone archetype name),
//! resolves free-form stem names and note-event program numbers to canonical
//! channels, and answers pairwise interaction queries. It is built once at
//! startup and shared read-only; nothing in it mutates after construction.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tone::{self, ToneArchetype};

/// Canonical channel identifier. Values follow note-event channel convention
/// (drums on channel 10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u8);

impl ChannelId {
    pub const BASS: ChannelId = ChannelId(2);
    pub const RHYTHM_GUITAR: ChannelId = ChannelId(3);
    pub const LEAD_GUITAR: ChannelId = ChannelId(4);
    pub const ORGAN: ChannelId = ChannelId(5);
    pub const PIANO: ChannelId = ChannelId(6);
    pub const CLAVINET: ChannelId = ChannelId(7);
    pub const DRUMS: ChannelId = ChannelId(10);
    pub const PERCUSSION: ChannelId = ChannelId(11);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ensemble role an agent plays on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Foundation,
    Timekeeper,
    Comping,
    Lead,
    Pad,
    Accent,
}

impl AgentRole {
    pub fn label(&self) -> &'static str {
        match self {
            AgentRole::Foundation => "foundation",
            AgentRole::Timekeeper => "timekeeper",
            AgentRole::Comping => "comping",
            AgentRole::Lead => "lead",
            AgentRole::Pad => "pad",
            AgentRole::Accent => "accent",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How one channel typically relates to another in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionType {
    RhythmicallyLockedTo,
    CallsAndRespondsWith,
    ProvidesHarmonicSupportTo,
    FollowsDynamicsOf,
    TradesAccentsWith,
}

impl InteractionType {
    pub fn label(&self) -> &'static str {
        match self {
            InteractionType::RhythmicallyLockedTo => "rhythmically-locked-to",
            InteractionType::CallsAndRespondsWith => "calls-and-responds-with",
            InteractionType::ProvidesHarmonicSupportTo => "provides-harmonic-support-to",
            InteractionType::FollowsDynamicsOf => "follows-dynamics-of",
            InteractionType::TradesAccentsWith => "trades-accents-with",
        }
    }

    /// Baseline coupling strength implied by the interaction type, used to
    /// seed per-channel interaction strengths before any timing evidence.
    pub fn base_strength(&self) -> f64 {
        match self {
            InteractionType::RhythmicallyLockedTo => 0.95,
            InteractionType::CallsAndRespondsWith => 0.75,
            InteractionType::ProvidesHarmonicSupportTo => 0.80,
            InteractionType::FollowsDynamicsOf => 0.65,
            InteractionType::TradesAccentsWith => 0.60,
        }
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Static profile for the agent that owns one canonical channel.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub channel: ChannelId,
    pub instrument: &'static str,
    pub role: AgentRole,
    /// Playable note range (note numbers, inclusive).
    pub note_range: (u8, u8),
    /// Typical velocity window.
    pub velocity_range: (u8, u8),
    /// Typical micro-timing deviation in seconds.
    pub timing_variation: f64,
    pub playing_patterns: &'static [&'static str],
    pub harmonic_function: &'static str,
    pub behavioral_traits: &'static [(&'static str, f64)],
}

impl AgentProfile {
    /// Tone archetype for this agent's instrument.
    pub fn tone(&self) -> &'static ToneArchetype {
        tone::archetype_or_default(self.instrument)
    }
}

/// Read-only channel registry. Construct once, share by reference.
#[derive(Debug)]
pub struct ChannelRegistry {
    agents: Vec<AgentProfile>,
    by_channel: HashMap<ChannelId, usize>,
    stem_index: HashMap<&'static str, ChannelId>,
    interactions: HashMap<(ChannelId, ChannelId), InteractionType>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let agents = builtin_agents();
        let by_channel = agents
            .iter()
            .enumerate()
            .map(|(idx, agent)| (agent.channel, idx))
            .collect();
        let stem_index = STEM_NAME_MAP.iter().copied().collect();
        let interactions = INTERACTION_MATRIX
            .iter()
            .map(|&(a, b, kind)| ((a, b), kind))
            .collect();

        ChannelRegistry {
            agents,
            by_channel,
            stem_index,
            interactions,
        }
    }

    pub fn get_agent(&self, channel: ChannelId) -> Option<&AgentProfile> {
        self.by_channel.get(&channel).map(|&idx| &self.agents[idx])
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.by_channel.contains_key(&channel)
    }

    /// All registered agents, in table order.
    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    /// Resolve a free-form stem/instrument name ("Bass", "drums", "keys") to
    /// its canonical channel. Fixed lookup table; unknown names map to None.
    pub fn map_stem_name_to_channel(&self, name: &str) -> Option<ChannelId> {
        let normalized = name.trim().to_lowercase();
        self.stem_index.get(normalized.as_str()).copied()
    }

    /// Resolve a note-event program number to its canonical channel.
    /// Percussion-flagged tracks always map to the drum channel.
    pub fn map_program_to_channel(&self, program: u8, is_percussion: bool) -> Option<ChannelId> {
        if is_percussion {
            return Some(ChannelId::DRUMS);
        }
        match program {
            0..=6 => Some(ChannelId::PIANO),
            7 => Some(ChannelId::CLAVINET),
            16..=20 => Some(ChannelId::ORGAN),
            24..=28 => Some(ChannelId::RHYTHM_GUITAR),
            29..=31 => Some(ChannelId::LEAD_GUITAR),
            32..=39 => Some(ChannelId::BASS),
            112..=119 => Some(ChannelId::PERCUSSION),
            _ => None,
        }
    }

    /// Canonical (program, percussion-flag) pair used when standardizing a
    /// note-event document onto this channel.
    pub fn canonical_program(&self, channel: ChannelId) -> Option<(u8, bool)> {
        match channel {
            ChannelId::BASS => Some((33, false)),
            ChannelId::RHYTHM_GUITAR => Some((27, false)),
            ChannelId::LEAD_GUITAR => Some((30, false)),
            ChannelId::ORGAN => Some((17, false)),
            ChannelId::PIANO => Some((0, false)),
            ChannelId::CLAVINET => Some((7, false)),
            ChannelId::DRUMS => Some((0, true)),
            ChannelId::PERCUSSION => Some((115, false)),
            _ => None,
        }
    }

    /// Directed interaction lookup: how does `a` relate to `b`?
    pub fn interaction_between(&self, a: ChannelId, b: ChannelId) -> Option<InteractionType> {
        self.interactions.get(&(a, b)).copied()
    }

    /// All interaction partners of `channel`, with the interaction type.
    pub fn interactions_of(&self, channel: ChannelId) -> Vec<(ChannelId, InteractionType)> {
        let mut partners: Vec<(ChannelId, InteractionType)> = self
            .interactions
            .iter()
            .filter(|((a, _), _)| *a == channel)
            .map(|((_, b), kind)| (*b, *kind))
            .collect();
        partners.sort_by_key(|(b, _)| *b);
        partners
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_agents() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            channel: ChannelId::BASS,
            instrument: "bass",
            role: AgentRole::Foundation,
            note_range: (28, 55),
            velocity_range: (60, 110),
            timing_variation: 0.012,
            playing_patterns: &["root_emphasis", "walking_lines", "offbeat_rests"],
            harmonic_function: "root_provider",
            behavioral_traits: &[
                ("root_emphasis", 0.90),
                ("walking_tendency", 0.30),
                ("syncopation", 0.60),
            ],
        },
        AgentProfile {
            channel: ChannelId::RHYTHM_GUITAR,
            instrument: "rhythm_guitar",
            role: AgentRole::Comping,
            note_range: (40, 76),
            velocity_range: (50, 100),
            timing_variation: 0.018,
            playing_patterns: &["upstroke_skank", "chord_damping"],
            harmonic_function: "rhythm_provider",
            behavioral_traits: &[
                ("upstroke_bias", 0.95),
                ("damping", 0.85),
                ("sustain", 0.15),
            ],
        },
        AgentProfile {
            channel: ChannelId::LEAD_GUITAR,
            instrument: "lead_guitar",
            role: AgentRole::Lead,
            note_range: (50, 88),
            velocity_range: (55, 115),
            timing_variation: 0.025,
            playing_patterns: &["call_response_fills", "melodic_hooks"],
            harmonic_function: "melodic_lead",
            behavioral_traits: &[
                ("phrase_density", 0.50),
                ("bend_usage", 0.60),
                ("space", 0.70),
            ],
        },
        AgentProfile {
            channel: ChannelId::ORGAN,
            instrument: "organ",
            role: AgentRole::Pad,
            note_range: (36, 84),
            velocity_range: (45, 95),
            timing_variation: 0.020,
            playing_patterns: &["bubble_shuffle", "sustained_pads"],
            harmonic_function: "harmonic_support",
            behavioral_traits: &[
                ("sustain", 0.90),
                ("bubble_drive", 0.75),
                ("swell_usage", 0.50),
            ],
        },
        AgentProfile {
            channel: ChannelId::PIANO,
            instrument: "piano",
            role: AgentRole::Comping,
            note_range: (36, 84),
            velocity_range: (40, 110),
            timing_variation: 0.015,
            playing_patterns: &["chord_stabs", "turnaround_runs"],
            harmonic_function: "chord_voicing",
            behavioral_traits: &[("stab_emphasis", 0.70), ("comping_density", 0.50)],
        },
        AgentProfile {
            channel: ChannelId::CLAVINET,
            instrument: "clavinet",
            role: AgentRole::Accent,
            note_range: (36, 72),
            velocity_range: (60, 115),
            timing_variation: 0.010,
            playing_patterns: &["muted_funk_riffs", "syncopated_stabs"],
            harmonic_function: "percussive_harmony",
            behavioral_traits: &[("mute_pressure", 0.90), ("riff_repetition", 0.80)],
        },
        AgentProfile {
            channel: ChannelId::DRUMS,
            instrument: "drums",
            role: AgentRole::Timekeeper,
            note_range: (35, 59),
            velocity_range: (40, 127),
            timing_variation: 0.006,
            playing_patterns: &["one_drop", "ghost_notes", "rimshot_accents"],
            harmonic_function: "rhythm_foundation",
            behavioral_traits: &[
                ("pocket_discipline", 0.95),
                ("ghost_note_density", 0.70),
                ("fill_frequency", 0.40),
            ],
        },
        AgentProfile {
            channel: ChannelId::PERCUSSION,
            instrument: "percussion",
            role: AgentRole::Accent,
            note_range: (60, 81),
            velocity_range: (35, 105),
            timing_variation: 0.008,
            playing_patterns: &["offbeat_clave", "fill_flourishes"],
            harmonic_function: "rhythmic_color",
            behavioral_traits: &[("offbeat_bias", 0.85), ("color_density", 0.60)],
        },
    ]
}

/// Stem-name → canonical channel. Fixed table; matching is done on the
/// trimmed, lowercased name.
const STEM_NAME_MAP: &[(&str, ChannelId)] = &[
    ("bass", ChannelId::BASS),
    ("drums", ChannelId::DRUMS),
    ("drum", ChannelId::DRUMS),
    ("guitar", ChannelId::RHYTHM_GUITAR),
    ("rhythm_guitar", ChannelId::RHYTHM_GUITAR),
    ("lead_guitar", ChannelId::LEAD_GUITAR),
    ("organ", ChannelId::ORGAN),
    ("keys", ChannelId::ORGAN),
    ("piano", ChannelId::PIANO),
    ("clavinet", ChannelId::CLAVINET),
    ("clav", ChannelId::CLAVINET),
    ("percussion", ChannelId::PERCUSSION),
    ("perc", ChannelId::PERCUSSION),
];

/// Directed interaction matrix. Both directions are listed where the musical
/// relationship is mutual (bass and drums lock to each other).
const INTERACTION_MATRIX: &[(ChannelId, ChannelId, InteractionType)] = &[
    (ChannelId::BASS, ChannelId::DRUMS, InteractionType::RhythmicallyLockedTo),
    (ChannelId::DRUMS, ChannelId::BASS, InteractionType::RhythmicallyLockedTo),
    (ChannelId::RHYTHM_GUITAR, ChannelId::DRUMS, InteractionType::RhythmicallyLockedTo),
    (ChannelId::CLAVINET, ChannelId::BASS, InteractionType::RhythmicallyLockedTo),
    (ChannelId::ORGAN, ChannelId::BASS, InteractionType::ProvidesHarmonicSupportTo),
    (ChannelId::PIANO, ChannelId::BASS, InteractionType::ProvidesHarmonicSupportTo),
    (ChannelId::ORGAN, ChannelId::RHYTHM_GUITAR, InteractionType::TradesAccentsWith),
    (ChannelId::PERCUSSION, ChannelId::DRUMS, InteractionType::TradesAccentsWith),
    (ChannelId::LEAD_GUITAR, ChannelId::RHYTHM_GUITAR, InteractionType::CallsAndRespondsWith),
    (ChannelId::LEAD_GUITAR, ChannelId::ORGAN, InteractionType::CallsAndRespondsWith),
    (ChannelId::PIANO, ChannelId::ORGAN, InteractionType::FollowsDynamicsOf),
];
