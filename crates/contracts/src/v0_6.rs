// This file is part of opbundler.
//
// opbundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// opbundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with opbundler.
// If not, see https://www.gnu.org/licenses/.

// Contracts from https://github.com/eth-infinitism/account-abstraction/tree/releases/v0.6/contracts

use alloy_sol_macro::sol;

sol! {
    #[allow(missing_docs)]
    #[derive(Default, Debug, PartialEq, Eq)]
    struct UserOperation {
        address sender;
        uint256 nonce;
        bytes initCode;
        bytes callData;
        uint256 callGasLimit;
        uint256 verificationGasLimit;
        uint256 preVerificationGas;
        uint256 maxFeePerGas;
        uint256 maxPriorityFeePerGas;
        bytes paymasterAndData;
        bytes signature;
    }

    #[allow(missing_docs)]
    #[derive(Default, Debug, PartialEq, Eq)]
    struct ReturnInfo {
        uint256 preOpGas;
        uint256 prefund;
        bool sigFailed;
        uint48 validAfter;
        uint48 validUntil;
        bytes paymasterContext;
    }

    #[allow(missing_docs)]
    #[derive(Default, Debug, PartialEq, Eq)]
    struct StakeInfo {
        uint256 stake;
        uint256 unstakeDelaySec;
    }

    #[allow(missing_docs)]
    #[derive(Default, Debug, PartialEq, Eq)]
    struct DepositInfo {
        uint112 deposit;
        bool staked;
        uint112 stake;
        uint32 unstakeDelaySec;
        uint48 withdrawTime;
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    #[derive(Default, Debug, PartialEq, Eq)]
    interface IEntryPoint {
        event UserOperationEvent(bytes32 indexed userOpHash, address indexed sender, address indexed paymaster, uint256 nonce, bool success, uint256 actualGasCost, uint256 actualGasUsed);

        error FailedOp(uint256 opIndex, string reason);

        error ValidationResult(ReturnInfo returnInfo,
            StakeInfo senderInfo, StakeInfo factoryInfo, StakeInfo paymasterInfo);

        error SignatureValidationFailed(address aggregator);

        function handleOps(UserOperation[] calldata ops, address payable beneficiary);

        function depositTo(address account) external payable;

        function getDepositInfo(
            address account
        ) external view returns (DepositInfo memory info);

        function balanceOf(address account) external view returns (uint256);

        function simulateValidation(UserOperation calldata userOp) external;
    }
}

#[cfg(test)]
mod tests {
    use alloy_sol_types::SolCall;

    use super::IEntryPoint;

    #[test]
    fn entry_point_selectors() {
        assert_eq!(IEntryPoint::handleOpsCall::SELECTOR, [0x1f, 0xad, 0x94, 0x8c]);
        assert_eq!(
            IEntryPoint::simulateValidationCall::SELECTOR,
            [0xee, 0x21, 0x94, 0x23]
        );
        assert_eq!(IEntryPoint::balanceOfCall::SELECTOR, [0x70, 0xa0, 0x82, 0x31]);
    }
}
