// colloquy-common: wire types shared across the colloquy workspace

pub mod protocol;
