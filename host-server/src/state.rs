/// Shared application state accessible across all API handlers.
///
/// The relay core is stateless at the router level: every channel gets
/// its own `RelayManager` instance at upgrade time, so there is nothing
/// to share between handlers beyond what axum's extractors already give
/// them. Kept as a unit struct (rather than removed) so new ambient
/// state — metrics handles, shutdown signals — has somewhere to land.
#[derive(Clone, Default)]
pub struct AppState;
