/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

/// Hasher builder used by the maps when none is given explicitly.
pub type DefaultBuildHasher = std::collections::hash_map::RandomState;
