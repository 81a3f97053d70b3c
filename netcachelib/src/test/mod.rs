mod persist_tests;
mod tests;
