// rsmp-test-utils: Shared test utilities for the RSMP suite.
//
// Provides a scriptable raw peer and a listener for integration testing of
// proxies, sites and supervisors over real TCP.

pub mod mock_listener;
pub mod mock_peer;

pub use mock_listener::MockListener;
pub use mock_peer::MockPeer;
