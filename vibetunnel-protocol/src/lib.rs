// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! vibetunnel-protocol defines the wire and on-disk types shared between
//! VibeTunnel nodes: session rows, the binary grid-snapshot codec, the
//! buffer-fan-out frame format, and federation registration payloads. You
//! almost certainly don't need to use it directly unless you are writing
//! another client against the HTTP/WebSocket surface.

pub mod federation;
pub mod frame;
pub mod session;
pub mod snapshot;
pub mod textevent;

pub use federation::{RegisterRemoteRequest, RegisterRemoteResponse, RemoteDescriptor, RemoteSummary};
pub use frame::{BufferFrame, FrameError};
pub use session::{
    CleanupExitedResponse, CreateSessionRequest, CreateSessionResponse, HealthResponse, InputRequest, NodeMode,
    RemoteCleanupResult, ResizeRequest, ResizeResponse, SessionRow, SessionSource, SessionStatus,
    SimpleSuccessResponse,
};
pub use snapshot::{Attrs, Cell, CodecError, Color, GridSnapshot};
pub use textevent::{StreamEvent, StreamHeader};
