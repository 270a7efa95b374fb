pub mod dalle_bart;
