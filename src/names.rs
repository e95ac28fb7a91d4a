use rand_core::{OsRng, RngCore};

pub trait NameGenerator: Send + Sync {
    fn make_name(&self) -> String;
}

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "dapper", "eager", "fancy", "gentle", "happy", "icy", "jolly",
    "keen", "lively", "mellow", "nimble", "odd", "plucky", "quiet", "rapid", "sunny", "tidy",
    "upbeat", "vivid", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "crane", "dingo", "egret", "falcon", "gecko", "heron", "ibis", "jackal", "koala",
    "lemur", "marten", "newt", "otter", "puffin", "quail", "raven", "stoat", "tapir", "urchin",
    "vole", "walrus", "yak", "zebu",
];

/// `<adjective>-<noun>` names drawn from the OS RNG.
#[derive(Default)]
pub struct PetNameGenerator;

impl NameGenerator for PetNameGenerator {
    fn make_name(&self) -> String {
        let pick = |words: &[&'static str]| words[OsRng.next_u32() as usize % words.len()];
        format!("{}-{}", pick(ADJECTIVES), pick(NOUNS))
    }
}
