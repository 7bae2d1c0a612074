//! These models represent the objects passed around by the tool-calling loop
//!
//! There are several different related formats we need to interact with:
//! - ui messages, sent from the client to the chat endpoint
//! - data stream frames, sent from the chat endpoint back to the client
//! - openai messages/tools, sent from the loop to the model backend
//! - json-rpc tool results, returned by remote tool servers
//!
//! These all overlap to varying degrees. We always immediately convert those data models
//! into the internal structs using to/from helpers. Because of the need for compatibility,
//! the internal models are not an exact match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
