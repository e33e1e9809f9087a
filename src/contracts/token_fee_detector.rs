use ethers::prelude::abigen;

abigen!(
    TokenFeeDetector,
    r#"[
        function validate(address token, address baseToken, uint256 amountToBorrow) external returns (uint256 buyFeeBps, uint256 sellFeeBps)
    ]"#
);
