pub mod card;
pub mod config;
pub mod database;
pub mod generator;
pub mod http_client;
pub mod importer;
pub mod ingest;
pub mod llm_client;
pub mod loader;
pub mod report;
pub mod retry;
pub mod runtime;
pub mod tagger;
pub mod taxonomy;

#[cfg(test)]
mod testing;
