//! Worker wire messages.
//!
//! Field numbers are part of the protocol spoken by existing worker binaries
//! and must not change.

/// An input file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Input {
    /// Path of the input, relative to the exec root or absolute.
    #[prost(string, tag = "1")]
    pub path: String,
    /// Opaque content digest.
    #[prost(bytes = "vec", tag = "2")]
    pub digest: Vec<u8>,
}

/// A single unit of work sent to a worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkRequest {
    #[prost(string, repeated, tag = "1")]
    pub arguments: Vec<String>,
    /// Inputs the worker may read while handling this request.
    #[prost(message, repeated, tag = "2")]
    pub inputs: Vec<Input>,
    /// Zero for singleplex workers; unique per outstanding request otherwise.
    #[prost(int32, tag = "3")]
    pub request_id: i32,
}

/// The worker's answer to a [`WorkRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkResponse {
    #[prost(int32, tag = "1")]
    pub exit_code: i32,
    /// Diagnostics shown to the user (compiler warnings, errors, ...).
    #[prost(string, tag = "2")]
    pub output: String,
    /// Echoes the `request_id` of the request it answers.
    #[prost(int32, tag = "3")]
    pub request_id: i32,
}

impl Input {
    pub fn new(path: impl Into<String>, digest: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
        }
    }
}

impl WorkRequest {
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            inputs: Vec::new(),
            request_id: 0,
        }
    }

    pub fn with_input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_request_id(mut self, request_id: i32) -> Self {
        self.request_id = request_id;
        self
    }
}

impl WorkResponse {
    pub fn new(exit_code: i32, output: impl Into<String>, request_id: i32) -> Self {
        Self {
            exit_code,
            output: output.into(),
            request_id,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
