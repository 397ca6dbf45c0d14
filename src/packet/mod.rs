// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Wire formats: the test header, typed header chains, topology builders and
//! the receive-side frame parser.

pub mod builder;
pub mod chain;
pub mod checksum;
pub mod header;
pub mod parser;

pub use builder::{
    build, frame_capacity, BuildContext, BuildError, BuiltPacket, FlowAddresses, PacketBuffer,
    Topology, MOCK_IPV4_LOCAL, MOCK_IPV6_LINK_LOCAL,
};
pub use chain::{Header, HeaderChain};
pub use header::{
    Direction, HeaderScope, StreamKind, SubType, TestHeader, Timestamp, TEST_HEADER_LEN,
};
pub use parser::{parse_frame, ParseError, ParsedFrame};
