// Contracts Module - Public ABIs Only

pub mod erc20;
pub mod token_fee_detector;
pub mod uniswap_v3;

pub use erc20::Erc20;
pub use token_fee_detector::TokenFeeDetector;
pub use uniswap_v3::{QuoterV2, UniswapV3Pool};
