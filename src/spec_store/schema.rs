// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, you can obtain one at https://mozilla.org/MPL/2.0/.

diesel::table! {
    api_specs (api_name) {
        api_name -> Text,
        cmd -> Text,
        image_name -> Text,
        endpoint_in -> Integer,
        endpoint_out -> Integer,
        timeout_secs -> Integer,
        methods -> Text,
        publisher -> Nullable<Text>,
        create_time -> BigInt,
    }
}
