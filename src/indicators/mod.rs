// =============================================================================
// Indicator Kernel
// =============================================================================
//
// Pure, side-effect-free numerical transforms over candle sequences and plain
// numeric series.  This module is the only place raw candles are consumed;
// analysts receive computed summaries.  Every public function returns
// `Option<T>` (or an empty Vec for series) so callers are forced to handle
// insufficient-data and numerical-edge-case scenarios.  Running any function
// twice on the same input yields identical output.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod options;
pub mod pairs;
pub mod pivots;
pub mod rsi;
pub mod stochastic;
pub mod volume;
