pub mod llm;
pub mod turn;
