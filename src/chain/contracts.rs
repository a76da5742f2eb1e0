//! Solidity surfaces of the deployed system and the calldata for every write.

use alloy::primitives::{Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use super::ContractCall;
use crate::error::ChainError;

sol! {
    #[derive(Debug)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function balanceOf(address owner) external view returns (uint256 balance);
        function totalSupply() external view returns (uint256 supply);
        function decimals() external view returns (uint8 places);
        function approve(address spender, uint256 amount) external returns (bool);
    }

    /// Testnet USDC exposes an open faucet mint.
    #[derive(Debug)]
    interface IMintable {
        function mint(address to, uint256 amount) external;
    }

    #[derive(Debug)]
    interface IUniswapV2Pair {
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
        function token0() external view returns (address token);
    }

    #[derive(Debug)]
    interface IUniswapV2Router02 {
        function getAmountsOut(uint amountIn, address[] calldata path) external view returns (uint[] memory amounts);

        function swapExactTokensForTokens(
            uint amountIn,
            uint amountOutMin,
            address[] calldata path,
            address to,
            uint deadline
        ) external returns (uint[] memory amounts);

        function addLiquidity(
            address tokenA,
            address tokenB,
            uint amountADesired,
            uint amountBDesired,
            uint amountAMin,
            uint amountBMin,
            address to,
            uint deadline
        ) external returns (uint amountA, uint amountB, uint liquidity);

        function removeLiquidity(
            address tokenA,
            address tokenB,
            uint liquidity,
            uint amountAMin,
            uint amountBMin,
            address to,
            uint deadline
        ) external returns (uint amountA, uint amountB);
    }

    #[derive(Debug)]
    interface IDao {
        function epoch() external view returns (uint256 current);
        function totalCoupons() external view returns (uint256 coupons);
        function totalRedeemable() external view returns (uint256 redeemable);
        function balanceOf(address account) external view returns (uint256 shares);
        function balanceOfStaged(address account) external view returns (uint256 staged);
        function balanceOfCoupons(address account, uint256 epoch) external view returns (uint256 coupons);
        function getCouponsCurrentAssignedIndex(address account) external view returns (uint256 index);
        function getCouponsAssignedAtEpoch(address account, uint256 index) external view returns (uint256 expiry);

        function advance() external;
        function placeCouponAuctionBid(uint256 couponEpochExpiry, uint256 dollarAmount, uint256 maxCouponAmount) external returns (bool);
        function redeemCoupons(uint256 couponEpoch, uint256 couponAmount) external;
        function deposit(uint256 value) external;
        function bond(uint256 value) external;
        function unbond(uint256 value) external;
    }
}

/// Decode the return data of `C`, rejecting anything malformed.
pub fn decode_returns<C: SolCall>(data: &[u8]) -> Result<C::Return, ChainError> {
    C::abi_decode_returns(data, true)
        .map_err(|e| ChainError::Decode(format!("{} returned bad data: {}", C::SIGNATURE, e)))
}

/// Narrow an on-chain uint to `u64`.
pub fn to_u64(value: U256, what: &str) -> Result<u64, ChainError> {
    u64::try_from(value).map_err(|_| ChainError::Decode(format!("{} {} does not fit in u64", what, value)))
}

/// ABI-encoded calldata for a state-changing call.
pub fn calldata(call: &ContractCall) -> Bytes {
    let data = match call.clone() {
        ContractCall::Approve { spender, amount } => IERC20::approveCall { spender, amount }.abi_encode(),
        ContractCall::Mint { to, amount } => IMintable::mintCall { to, amount }.abi_encode(),
        ContractCall::SwapExactTokensForTokens {
            amount_in,
            amount_out_min,
            path,
            to,
            deadline,
        } => IUniswapV2Router02::swapExactTokensForTokensCall {
            amountIn: amount_in,
            amountOutMin: amount_out_min,
            path,
            to,
            deadline,
        }
        .abi_encode(),
        ContractCall::AddLiquidity {
            token_a,
            token_b,
            amount_a_desired,
            amount_b_desired,
            amount_a_min,
            amount_b_min,
            to,
            deadline,
        } => IUniswapV2Router02::addLiquidityCall {
            tokenA: token_a,
            tokenB: token_b,
            amountADesired: amount_a_desired,
            amountBDesired: amount_b_desired,
            amountAMin: amount_a_min,
            amountBMin: amount_b_min,
            to,
            deadline,
        }
        .abi_encode(),
        ContractCall::RemoveLiquidity {
            token_a,
            token_b,
            liquidity,
            amount_a_min,
            amount_b_min,
            to,
            deadline,
        } => IUniswapV2Router02::removeLiquidityCall {
            tokenA: token_a,
            tokenB: token_b,
            liquidity,
            amountAMin: amount_a_min,
            amountBMin: amount_b_min,
            to,
            deadline,
        }
        .abi_encode(),
        ContractCall::Advance => IDao::advanceCall {}.abi_encode(),
        ContractCall::PlaceCouponAuctionBid {
            coupon_epoch_expiry,
            dollar_amount,
            max_coupon_amount,
        } => IDao::placeCouponAuctionBidCall {
            couponEpochExpiry: U256::from(coupon_epoch_expiry),
            dollarAmount: dollar_amount,
            maxCouponAmount: max_coupon_amount,
        }
        .abi_encode(),
        ContractCall::RedeemCoupons { coupon_epoch, amount } => IDao::redeemCouponsCall {
            couponEpoch: U256::from(coupon_epoch),
            couponAmount: amount,
        }
        .abi_encode(),
        ContractCall::Deposit { amount } => IDao::depositCall { value: amount }.abi_encode(),
        ContractCall::Bond { amount } => IDao::bondCall { value: amount }.abi_encode(),
        ContractCall::Unbond { shares } => IDao::unbondCall { value: shares }.abi_encode(),
    };
    Bytes::from(data)
}
