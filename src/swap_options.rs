//! Swap execution options for the two supported routers.
//!
//! Optional request fields are grouped per concern into tagged variants, so a
//! permit with half of its fields or a portion without a recipient cannot be
//! represented.

use crate::error::{ProviderError, Result};
use crate::quote::TradeType;
use ethers::types::{Address, Bytes, Signature, U256};
use serde::Serialize;
use std::str::FromStr;

/// Seconds added to "now" when a request carries no deadline.
pub const DEFAULT_DEADLINE: u64 = 600;

pub const BIPS_BASE: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percent {
    pub numerator: u64,
    pub denominator: u64,
}

impl Percent {
    pub fn from_bips(bips: u64) -> Self {
        Self {
            numerator: bips,
            denominator: BIPS_BASE,
        }
    }
}

fn invalid(field: &str, raw: &str) -> ProviderError {
    ProviderError::InvalidRequest(format!("invalid {field} '{raw}'"))
}

/// "1.25" (percent, two decimals) becomes 125 / 10_000.
pub fn parse_slippage_tolerance(raw: &str) -> Result<Percent> {
    let percent: f64 = raw
        .trim()
        .trim_end_matches('%')
        .parse()
        .map_err(|_| invalid("slippageTolerance", raw))?;
    if !percent.is_finite() || percent < 0.0 {
        return Err(invalid("slippageTolerance", raw));
    }
    Ok(Percent::from_bips((percent * 100.0).round() as u64))
}

/// Unix timestamp `raw` seconds after `now`.
pub fn deadline_after(now: i64, raw: &str) -> Result<u64> {
    let secs: u64 = raw.trim().parse().map_err(|_| invalid("deadline", raw))?;
    Ok((now.max(0) as u64).saturating_add(secs))
}

pub fn parse_deadline(raw: &str) -> Result<u64> {
    deadline_after(chrono::Utc::now().timestamp(), raw)
}

fn parse_amount(field: &str, raw: &str) -> Result<U256> {
    U256::from_dec_str(raw.trim()).map_err(|_| invalid(field, raw))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Eip2612Permit {
    Allowed { nonce: U256, expiry: U256 },
    Amount { amount: U256, deadline: U256 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PermitOption {
    None,
    /// Permit2 single-token permit, for the universal router.
    Permit2 {
        token: Address,
        signature: Bytes,
        nonce: U256,
        expiration: U256,
        amount: U256,
        sig_deadline: U256,
    },
    /// Token-native permit, for SwapRouter02.
    Eip2612 {
        v: u64,
        r: U256,
        s: U256,
        permit: Eip2612Permit,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortionOption {
    None,
    /// Fee on the output, exact-input trades only.
    Bips { bips: u32, recipient: Address },
    /// Flat fee amount, exact-output trades only.
    Flat { amount: U256, recipient: Address },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulateFrom {
    pub from_address: Address,
}

/// Raw permit fields as they arrive on the request.
#[derive(Debug, Clone, Default)]
pub struct PermitInput {
    pub signature: Option<String>,
    pub nonce: Option<String>,
    pub expiration: Option<String>,
    pub amount: Option<String>,
    pub sig_deadline: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SwapOptionsInput {
    pub token_in: Address,
    pub trade_type: TradeType,
    /// Raw amount of the quoted side.
    pub amount: U256,
    pub slippage_tolerance: Option<String>,
    pub enable_universal_router: bool,
    pub portion_bips: Option<u32>,
    pub portion_recipient: Option<Address>,
    pub portion_amount: Option<U256>,
    pub deadline: Option<String>,
    pub recipient: Option<Address>,
    pub permit: PermitInput,
    pub simulate_from_address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UniversalRouterOptions {
    pub slippage_tolerance: Percent,
    pub deadline: Option<u64>,
    pub recipient: Option<Address>,
    pub portion: PortionOption,
    pub permit: PermitOption,
    pub simulate: Option<SimulateFrom>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapRouter02Options {
    pub slippage_tolerance: Percent,
    pub deadline: u64,
    pub recipient: Address,
    pub permit: PermitOption,
    pub simulate: Option<SimulateFrom>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapOptions {
    UniversalRouter(UniversalRouterOptions),
    SwapRouter02(SwapRouter02Options),
}

pub struct SwapOptionsFactory;

impl SwapOptionsFactory {
    /// `Ok(None)` when the request asks for a quote only: no slippage, or for
    /// SwapRouter02 no deadline and recipient. Malformed fields are errors.
    pub fn assemble(input: &SwapOptionsInput) -> Result<Option<SwapOptions>> {
        if input.enable_universal_router {
            Ok(Self::universal_router(input)?.map(SwapOptions::UniversalRouter))
        } else {
            Ok(Self::swap_router_02(input)?.map(SwapOptions::SwapRouter02))
        }
    }

    fn universal_router(input: &SwapOptionsInput) -> Result<Option<UniversalRouterOptions>> {
        let Some(slippage) = input.slippage_tolerance.as_deref() else {
            return Ok(None);
        };
        let deadline = input.deadline.as_deref().map(parse_deadline).transpose()?;

        Ok(Some(UniversalRouterOptions {
            slippage_tolerance: parse_slippage_tolerance(slippage)?,
            deadline,
            recipient: input.recipient,
            portion: Self::portion(input),
            permit: Self::permit2(input)?,
            simulate: input.simulate_from_address.map(|from_address| SimulateFrom { from_address }),
        }))
    }

    fn swap_router_02(input: &SwapOptionsInput) -> Result<Option<SwapRouter02Options>> {
        let (Some(slippage), Some(deadline), Some(recipient)) = (
            input.slippage_tolerance.as_deref(),
            input.deadline.as_deref(),
            input.recipient,
        ) else {
            return Ok(None);
        };

        Ok(Some(SwapRouter02Options {
            slippage_tolerance: parse_slippage_tolerance(slippage)?,
            deadline: parse_deadline(deadline)?,
            recipient,
            permit: Self::eip2612(&input.permit)?,
            simulate: input.simulate_from_address.map(|from_address| SimulateFrom { from_address }),
        }))
    }

    /// Output amount times bips over 10_000, rounded down.
    pub fn portion_amount(amount: U256, bips: u32) -> U256 {
        amount * U256::from(bips) / U256::from(BIPS_BASE)
    }

    fn portion(input: &SwapOptionsInput) -> PortionOption {
        let Some(recipient) = input.portion_recipient else {
            return PortionOption::None;
        };
        match input.trade_type {
            TradeType::ExactInput => match input.portion_bips {
                Some(bips) if bips > 0 => PortionOption::Bips { bips, recipient },
                _ => PortionOption::None,
            },
            TradeType::ExactOutput => {
                let computed = input
                    .portion_bips
                    .filter(|b| *b > 0)
                    .map(|b| Self::portion_amount(input.amount, b));
                match input.portion_amount.or(computed) {
                    Some(amount) => PortionOption::Flat { amount, recipient },
                    None => PortionOption::None,
                }
            }
        }
    }

    fn permit2(input: &SwapOptionsInput) -> Result<PermitOption> {
        let p = &input.permit;
        let (Some(signature), Some(nonce), Some(expiration), Some(amount), Some(sig_deadline)) = (
            p.signature.as_deref(),
            p.nonce.as_deref(),
            p.expiration.as_deref(),
            p.amount.as_deref(),
            p.sig_deadline.as_deref(),
        ) else {
            return Ok(PermitOption::None);
        };

        Ok(PermitOption::Permit2 {
            token: input.token_in,
            signature: Bytes::from_str(signature).map_err(|_| invalid("permitSignature", signature))?,
            nonce: parse_amount("permitNonce", nonce)?,
            expiration: parse_amount("permitExpiration", expiration)?,
            amount: parse_amount("permitAmount", amount)?,
            sig_deadline: parse_amount("permitSigDeadline", sig_deadline)?,
        })
    }

    /// Nonce and expiration take precedence over amount and deadline.
    fn eip2612(p: &PermitInput) -> Result<PermitOption> {
        let Some(raw_signature) = p.signature.as_deref() else {
            return Ok(PermitOption::None);
        };
        let permit = match (
            p.nonce.as_deref(),
            p.expiration.as_deref(),
            p.amount.as_deref(),
            p.sig_deadline.as_deref(),
        ) {
            (Some(nonce), Some(expiry), _, _) => Eip2612Permit::Allowed {
                nonce: parse_amount("permitNonce", nonce)?,
                expiry: parse_amount("permitExpiration", expiry)?,
            },
            (_, _, Some(amount), Some(deadline)) => Eip2612Permit::Amount {
                amount: parse_amount("permitAmount", amount)?,
                deadline: parse_amount("permitSigDeadline", deadline)?,
            },
            _ => return Ok(PermitOption::None),
        };

        let signature =
            Signature::from_str(raw_signature).map_err(|_| invalid("permitSignature", raw_signature))?;
        Ok(PermitOption::Eip2612 {
            v: signature.v,
            r: signature.r,
            s: signature.s,
            permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> SwapOptionsInput {
        SwapOptionsInput {
            token_in: Address::repeat_byte(1),
            trade_type: TradeType::ExactInput,
            amount: U256::from(1_000_000u64),
            slippage_tolerance: Some("0.5".into()),
            enable_universal_router: true,
            portion_bips: None,
            portion_recipient: None,
            portion_amount: None,
            deadline: None,
            recipient: Some(Address::repeat_byte(9)),
            permit: PermitInput::default(),
            simulate_from_address: None,
        }
    }

    fn signature() -> String {
        format!("0x{}1b", "11".repeat(64))
    }

    #[test]
    fn test_parse_slippage_tolerance() {
        assert_eq!(parse_slippage_tolerance("1.25").unwrap(), Percent::from_bips(125));
        assert_eq!(parse_slippage_tolerance("0.5%").unwrap().numerator, 50);
        assert!(parse_slippage_tolerance("abc").is_err());
        assert!(parse_slippage_tolerance("-1").is_err());
    }

    #[test]
    fn test_deadline_is_relative() {
        assert_eq!(deadline_after(1_700_000_000, "600").unwrap(), 1_700_000_600);
        assert!(deadline_after(0, "soon").is_err());
    }

    #[test]
    fn test_no_slippage_means_quote_only() {
        let mut req = input();
        req.slippage_tolerance = None;
        assert!(SwapOptionsFactory::assemble(&req).unwrap().is_none());
        req.enable_universal_router = false;
        assert!(SwapOptionsFactory::assemble(&req).unwrap().is_none());
    }

    #[test]
    fn test_universal_router_portion_by_trade_type() {
        let mut req = input();
        req.portion_bips = Some(25);
        req.portion_recipient = Some(Address::repeat_byte(7));
        let Some(SwapOptions::UniversalRouter(opts)) = SwapOptionsFactory::assemble(&req).unwrap() else {
            panic!("expected universal router options");
        };
        assert_eq!(
            opts.portion,
            PortionOption::Bips {
                bips: 25,
                recipient: Address::repeat_byte(7)
            }
        );
        assert_eq!(opts.permit, PermitOption::None);

        req.trade_type = TradeType::ExactOutput;
        let Some(SwapOptions::UniversalRouter(opts)) = SwapOptionsFactory::assemble(&req).unwrap() else {
            panic!("expected universal router options");
        };
        assert_eq!(
            opts.portion,
            PortionOption::Flat {
                amount: U256::from(2_500u64),
                recipient: Address::repeat_byte(7)
            }
        );
    }

    #[test]
    fn test_partial_permit2_is_dropped() {
        let mut req = input();
        req.permit = PermitInput {
            signature: Some(signature()),
            nonce: Some("1".into()),
            ..Default::default()
        };
        let Some(SwapOptions::UniversalRouter(opts)) = SwapOptionsFactory::assemble(&req).unwrap() else {
            panic!("expected universal router options");
        };
        assert_eq!(opts.permit, PermitOption::None);

        req.permit.expiration = Some("100".into());
        req.permit.amount = Some("5".into());
        req.permit.sig_deadline = Some("200".into());
        let Some(SwapOptions::UniversalRouter(opts)) = SwapOptionsFactory::assemble(&req).unwrap() else {
            panic!("expected universal router options");
        };
        assert!(matches!(opts.permit, PermitOption::Permit2 { nonce, .. } if nonce == U256::one()));
    }

    #[test]
    fn test_swap_router_02_needs_deadline_and_recipient() {
        let mut req = input();
        req.enable_universal_router = false;
        assert!(SwapOptionsFactory::assemble(&req).unwrap().is_none());

        req.deadline = Some("600".into());
        req.permit = PermitInput {
            signature: Some(signature()),
            amount: Some("5".into()),
            sig_deadline: Some("200".into()),
            ..Default::default()
        };
        let Some(SwapOptions::SwapRouter02(opts)) = SwapOptionsFactory::assemble(&req).unwrap() else {
            panic!("expected swap router 02 options");
        };
        assert_eq!(opts.recipient, Address::repeat_byte(9));
        match opts.permit {
            PermitOption::Eip2612 { v, permit, .. } => {
                assert_eq!(v, 27);
                assert!(matches!(permit, Eip2612Permit::Amount { .. }));
            }
            other => panic!("unexpected permit {other:?}"),
        }
    }
}
