//! Fungible token balances for collateral assets and claim tokens.

use heed::{Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    state::{Db, Error},
    types::Address,
};

/// Tokens are identified by the address of their contract.
pub type TokenId = Address;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TokenError {
    #[error("token {token} already exists")]
    AlreadyExists { token: TokenId },
    #[error(
        "insufficient allowance for {spender} on {owner}'s {token} \
         ({allowance} < {required})"
    )]
    InsufficientAllowance {
        token: TokenId,
        owner: Address,
        spender: Address,
        allowance: u128,
        required: u128,
    },
    #[error(
        "insufficient {token} balance for {account} ({balance} < {required})"
    )]
    InsufficientBalance {
        token: TokenId,
        account: Address,
        balance: u128,
        required: u128,
    },
    #[error("{caller} is not the minter of {token}")]
    NotMinter { token: TokenId, caller: Address },
    #[error("supply of {token} would overflow")]
    SupplyOverflow { token: TokenId },
    #[error("unknown token {token}")]
    UnknownToken { token: TokenId },
    #[error("zero address")]
    ZeroAddress,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: u128,
    /// The only account allowed to mint or burn
    pub minter: Address,
}

#[derive(Clone)]
pub struct Tokens {
    info: Db<TokenId, TokenInfo>,
    /// (token, account) -> balance
    balances: Db<(TokenId, Address), u128>,
    /// (token, owner, spender) -> allowance
    allowances: Db<(TokenId, Address, Address), u128>,
}

impl Tokens {
    pub const NUM_DBS: u32 = 3;

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let info = env.create_database(rwtxn, Some("token_info"))?;
        let balances = env.create_database(rwtxn, Some("token_balances"))?;
        let allowances =
            env.create_database(rwtxn, Some("token_allowances"))?;
        Ok(Self {
            info,
            balances,
            allowances,
        })
    }

    pub fn create_token(
        &self,
        rwtxn: &mut RwTxn,
        token: TokenId,
        symbol: &str,
        decimals: u8,
        minter: Address,
    ) -> Result<(), Error> {
        if token.is_zero() || minter.is_zero() {
            return Err(TokenError::ZeroAddress.into());
        }
        if self.info.get(rwtxn, &token)?.is_some() {
            return Err(TokenError::AlreadyExists { token }.into());
        }
        let info = TokenInfo {
            symbol: symbol.to_owned(),
            decimals,
            total_supply: 0,
            minter,
        };
        self.info.put(rwtxn, &token, &info)?;
        tracing::debug!(%token, symbol, decimals, %minter, "created token");
        Ok(())
    }

    pub fn try_get_info(
        &self,
        rotxn: &RoTxn,
        token: TokenId,
    ) -> Result<Option<TokenInfo>, Error> {
        Ok(self.info.get(rotxn, &token)?)
    }

    pub fn get_info(
        &self,
        rotxn: &RoTxn,
        token: TokenId,
    ) -> Result<TokenInfo, Error> {
        self.try_get_info(rotxn, token)?
            .ok_or_else(|| TokenError::UnknownToken { token }.into())
    }

    pub fn decimals(&self, rotxn: &RoTxn, token: TokenId) -> Result<u8, Error> {
        Ok(self.get_info(rotxn, token)?.decimals)
    }

    pub fn total_supply(
        &self,
        rotxn: &RoTxn,
        token: TokenId,
    ) -> Result<u128, Error> {
        Ok(self.get_info(rotxn, token)?.total_supply)
    }

    pub fn balance_of(
        &self,
        rotxn: &RoTxn,
        token: TokenId,
        account: Address,
    ) -> Result<u128, Error> {
        Ok(self
            .balances
            .get(rotxn, &(token, account))?
            .unwrap_or_default())
    }

    pub fn allowance(
        &self,
        rotxn: &RoTxn,
        token: TokenId,
        owner: Address,
        spender: Address,
    ) -> Result<u128, Error> {
        Ok(self
            .allowances
            .get(rotxn, &(token, owner, spender))?
            .unwrap_or_default())
    }

    fn put_balance(
        &self,
        rwtxn: &mut RwTxn,
        token: TokenId,
        account: Address,
        balance: u128,
    ) -> Result<(), Error> {
        if balance == 0 {
            self.balances.delete(rwtxn, &(token, account))?;
        } else {
            self.balances.put(rwtxn, &(token, account), &balance)?;
        }
        Ok(())
    }

    /// Set the allowance of `spender` over `owner`'s balance
    pub fn approve(
        &self,
        rwtxn: &mut RwTxn,
        token: TokenId,
        owner: Address,
        spender: Address,
        amount: u128,
    ) -> Result<(), Error> {
        self.get_info(rwtxn, token)?;
        if spender.is_zero() {
            return Err(TokenError::ZeroAddress.into());
        }
        self.allowances
            .put(rwtxn, &(token, owner, spender), &amount)?;
        Ok(())
    }

    pub fn transfer(
        &self,
        rwtxn: &mut RwTxn,
        token: TokenId,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), Error> {
        self.get_info(rwtxn, token)?;
        if to.is_zero() {
            return Err(TokenError::ZeroAddress.into());
        }
        let from_balance = self.balance_of(rwtxn, token, from)?;
        if from_balance < amount {
            return Err(TokenError::InsufficientBalance {
                token,
                account: from,
                balance: from_balance,
                required: amount,
            }
            .into());
        }
        if from == to || amount == 0 {
            return Ok(());
        }
        let to_balance = self.balance_of(rwtxn, token, to)?;
        // cannot overflow, since the sum of balances is bounded by supply
        let to_balance = to_balance
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow { token })?;
        self.put_balance(rwtxn, token, from, from_balance - amount)?;
        self.put_balance(rwtxn, token, to, to_balance)?;
        Ok(())
    }

    /// Move `amount` from `from` to `to`, spending `spender`'s allowance
    pub fn transfer_from(
        &self,
        rwtxn: &mut RwTxn,
        token: TokenId,
        spender: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), Error> {
        let allowance = self.allowance(rwtxn, token, from, spender)?;
        if allowance < amount {
            return Err(TokenError::InsufficientAllowance {
                token,
                owner: from,
                spender,
                allowance,
                required: amount,
            }
            .into());
        }
        self.transfer(rwtxn, token, from, to, amount)?;
        self.allowances.put(
            rwtxn,
            &(token, from, spender),
            &(allowance - amount),
        )?;
        Ok(())
    }

    pub fn mint(
        &self,
        rwtxn: &mut RwTxn,
        token: TokenId,
        caller: Address,
        to: Address,
        amount: u128,
    ) -> Result<(), Error> {
        let mut info = self.get_info(rwtxn, token)?;
        if caller != info.minter {
            return Err(TokenError::NotMinter { token, caller }.into());
        }
        if to.is_zero() {
            return Err(TokenError::ZeroAddress.into());
        }
        info.total_supply = info
            .total_supply
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow { token })?;
        let balance = self.balance_of(rwtxn, token, to)? + amount;
        self.put_balance(rwtxn, token, to, balance)?;
        self.info.put(rwtxn, &token, &info)?;
        Ok(())
    }

    pub fn burn(
        &self,
        rwtxn: &mut RwTxn,
        token: TokenId,
        caller: Address,
        from: Address,
        amount: u128,
    ) -> Result<(), Error> {
        let mut info = self.get_info(rwtxn, token)?;
        if caller != info.minter {
            return Err(TokenError::NotMinter { token, caller }.into());
        }
        let balance = self.balance_of(rwtxn, token, from)?;
        if balance < amount {
            return Err(TokenError::InsufficientBalance {
                token,
                account: from,
                balance,
                required: amount,
            }
            .into());
        }
        info.total_supply -= amount;
        self.put_balance(rwtxn, token, from, balance - amount)?;
        self.info.put(rwtxn, &token, &info)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_env;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    #[test]
    fn mint_transfer_and_burn() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let tokens = Tokens::new(&env, &mut rwtxn).unwrap();
        let usdc = addr(1);
        let minter = addr(2);
        tokens.create_token(&mut rwtxn, usdc, "USDC", 6, minter).unwrap();

        tokens.mint(&mut rwtxn, usdc, minter, addr(3), 1_000).unwrap();
        tokens.transfer(&mut rwtxn, usdc, addr(3), addr(4), 400).unwrap();
        assert_eq!(tokens.balance_of(&rwtxn, usdc, addr(3)).unwrap(), 600);
        assert_eq!(tokens.balance_of(&rwtxn, usdc, addr(4)).unwrap(), 400);

        tokens.burn(&mut rwtxn, usdc, minter, addr(4), 400).unwrap();
        assert_eq!(tokens.total_supply(&rwtxn, usdc).unwrap(), 600);
        assert_eq!(tokens.balance_of(&rwtxn, usdc, addr(4)).unwrap(), 0);
    }

    #[test]
    fn only_minter_mints() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let tokens = Tokens::new(&env, &mut rwtxn).unwrap();
        tokens.create_token(&mut rwtxn, addr(1), "T", 18, addr(2)).unwrap();
        let err = tokens.mint(&mut rwtxn, addr(1), addr(9), addr(3), 1);
        assert!(matches!(
            err,
            Err(Error::Token(TokenError::NotMinter { .. }))
        ));
    }

    #[test]
    fn transfer_from_consumes_allowance() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let tokens = Tokens::new(&env, &mut rwtxn).unwrap();
        let (token, owner, spender) = (addr(1), addr(3), addr(5));
        tokens.create_token(&mut rwtxn, token, "T", 6, addr(2)).unwrap();
        tokens.mint(&mut rwtxn, token, addr(2), owner, 100).unwrap();

        let err =
            tokens.transfer_from(&mut rwtxn, token, spender, owner, spender, 1);
        assert!(matches!(
            err,
            Err(Error::Token(TokenError::InsufficientAllowance { .. }))
        ));

        tokens
            .approve(&mut rwtxn, token, owner, spender, 60)
            .unwrap();
        tokens
            .transfer_from(&mut rwtxn, token, spender, owner, spender, 50)
            .unwrap();
        assert_eq!(
            tokens.allowance(&rwtxn, token, owner, spender).unwrap(),
            10
        );
        assert_eq!(tokens.balance_of(&rwtxn, token, spender).unwrap(), 50);
    }

    #[test]
    fn overdraw_is_rejected() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let tokens = Tokens::new(&env, &mut rwtxn).unwrap();
        tokens.create_token(&mut rwtxn, addr(1), "T", 6, addr(2)).unwrap();
        tokens.mint(&mut rwtxn, addr(1), addr(2), addr(3), 5).unwrap();
        let err = tokens.transfer(&mut rwtxn, addr(1), addr(3), addr(4), 6);
        assert!(matches!(
            err,
            Err(Error::Token(TokenError::InsufficientBalance {
                balance: 5,
                required: 6,
                ..
            }))
        ));
        assert_eq!(tokens.balance_of(&rwtxn, addr(1), addr(3)).unwrap(), 5);
    }
}
