//! Human-readable names for guests and unnamed rooms.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "cosmic", "crisp", "daring", "dusty", "eager",
    "fancy", "fuzzy", "gentle", "glad", "golden", "happy", "humble", "jolly", "keen", "lively",
    "lucky", "mellow", "merry", "misty", "noble", "polite", "proud", "quick", "quiet", "rapid",
    "rosy", "rustic", "shiny", "silent", "smooth", "snappy", "solar", "spry", "stormy", "sunny",
    "swift", "tidy", "vivid", "wandering", "warm", "wild", "witty", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "dolphin", "falcon", "ferret", "finch", "fox", "gecko",
    "heron", "ibex", "jackal", "koala", "lemur", "lynx", "magpie", "marmot", "marten", "mole",
    "moose", "newt", "ocelot", "orca", "osprey", "otter", "owl", "panda", "pelican", "pony",
    "puffin", "quail", "rabbit", "raven", "robin", "seal", "shrew", "sparrow", "stoat", "swan",
    "tapir", "terrapin", "toad", "trout", "walrus", "weasel", "wombat", "wren",
];

const PLACES: &[&str] = &[
    "atrium", "bay", "bridge", "canyon", "cove", "creek", "delta", "dune", "field", "fjord",
    "forest", "garden", "glacier", "grove", "harbor", "hollow", "island", "lagoon", "meadow",
    "mesa", "oasis", "orchard", "plaza", "prairie", "reef", "ridge", "river", "summit", "tundra",
    "valley",
];

/// Word-list name generator, seeded once per process and owned by the hub.
pub struct NameGenerator {
    rng: StdRng,
}

impl NameGenerator {
    pub fn new() -> Self {
        NameGenerator {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn user_name(&mut self) -> String {
        let adjective = ADJECTIVES[self.rng.random_range(0..ADJECTIVES.len())];
        let animal = ANIMALS[self.rng.random_range(0..ANIMALS.len())];
        format!("{adjective}-{animal}")
    }

    pub fn room_name(&mut self) -> String {
        let adjective = ADJECTIVES[self.rng.random_range(0..ADJECTIVES.len())];
        let place = PLACES[self.rng.random_range(0..PLACES.len())];
        let suffix = self.rng.random_range(10..100);
        format!("{adjective}-{place}-{suffix}")
    }
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names_are_two_words() {
        let mut names = NameGenerator::new();
        let name = names.user_name();
        assert_eq!(name.split('-').count(), 2);
    }

    #[test]
    fn room_names_carry_a_numeric_suffix() {
        let mut names = NameGenerator::new();
        let name = names.room_name();
        let suffix = name.rsplit('-').next().unwrap();
        assert!(suffix.parse::<u32>().is_ok());
    }
}
